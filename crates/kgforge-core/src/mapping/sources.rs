//! Delimited-text mapping payloads and a local-file mapping source.

use super::{MappingSource, RemoteMarker};
use crate::types::MappingError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Picks a key column and a value column out of delimited text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelimitedTransform {
    pub key_column: usize,
    pub value_column: usize,
    pub delimiter: char,
    pub skip_header: bool,
}

impl Default for DelimitedTransform {
    fn default() -> Self {
        Self {
            key_column: 0,
            value_column: 1,
            delimiter: '\t',
            skip_header: true,
        }
    }
}

impl DelimitedTransform {
    /// Parse `payload`. Blank lines and `#` comments are ignored, rows with
    /// an empty key or value are skipped and the first occurrence of a key
    /// wins. A non-empty payload yielding no rows at all is an error, which
    /// catches error pages served in place of data.
    pub fn apply(&self, name: &str, payload: &[u8]) -> Result<BTreeMap<String, String>, MappingError> {
        let text = std::str::from_utf8(payload).map_err(|e| MappingError::Transform {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let mut entries = BTreeMap::new();
        let mut skipped = 0usize;
        let lines = text
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .skip(usize::from(self.skip_header));
        for line in lines {
            let fields: Vec<&str> = line.split(self.delimiter).collect();
            let key = fields.get(self.key_column).map(|s| s.trim());
            let value = fields.get(self.value_column).map(|s| s.trim());
            match (key, value) {
                (Some(k), Some(v)) if !k.is_empty() && !v.is_empty() => {
                    entries.entry(k.to_string()).or_insert_with(|| v.to_string());
                }
                _ => skipped += 1,
            }
        }

        if entries.is_empty() && skipped > 0 {
            return Err(MappingError::Transform {
                name: name.to_string(),
                reason: format!("no usable rows ({} skipped)", skipped),
            });
        }
        if skipped > 0 {
            tracing::debug!(mapping = name, skipped, "skipped incomplete mapping rows");
        }
        Ok(entries)
    }
}

/// Mapping read from a local file. The probe reports the file's size and
/// modification time.
#[derive(Debug, Clone)]
pub struct FileMappingSource {
    name: String,
    path: PathBuf,
    transform: DelimitedTransform,
}

impl FileMappingSource {
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, transform: DelimitedTransform) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            transform,
        }
    }
}

impl MappingSource for FileMappingSource {
    fn fetch(&self) -> Result<Vec<u8>, MappingError> {
        std::fs::read(&self.path).map_err(|e| MappingError::Fetch {
            name: self.name.clone(),
            reason: format!("{}: {}", self.path.display(), e),
        })
    }

    fn probe(&self) -> Result<Option<RemoteMarker>, MappingError> {
        let metadata = std::fs::metadata(&self.path).map_err(|e| MappingError::Fetch {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let last_modified = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
        Ok(Some(RemoteMarker {
            etag: None,
            last_modified,
            content_length: Some(metadata.len()),
        }))
    }

    fn transform(&self, payload: &[u8]) -> Result<BTreeMap<String, String>, MappingError> {
        self.transform.apply(&self.name, payload)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_configured_columns() {
        let transform = DelimitedTransform {
            key_column: 1,
            value_column: 0,
            delimiter: ',',
            skip_header: false,
        };
        let table = transform
            .apply("t", b"ENSG1,TP53\n# comment\n\nENSG2,BRCA1\nENSG3,TP53\n")
            .expect("table");
        assert_eq!(table.len(), 2);
        assert_eq!(table["TP53"], "ENSG1");
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let result = DelimitedTransform::default().apply("t", b"header\n<html>oops</html>\n");
        assert!(matches!(result, Err(MappingError::Transform { .. })));
    }

    #[test]
    fn header_only_payload_is_empty_not_error() {
        let table = DelimitedTransform::default()
            .apply("t", b"symbol\tensembl\n")
            .expect("table");
        assert!(table.is_empty());
    }

    #[test]
    fn file_source_probe_reports_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map.tsv");
        std::fs::write(&path, "a\tb\nk\tv\n").expect("write");
        let source = FileMappingSource::new("m", &path, DelimitedTransform::default());
        let marker = source.probe().expect("probe").expect("marker");
        assert_eq!(marker.content_length, Some(8));
        assert!(marker.last_modified.is_some());
        let table = source
            .transform(&source.fetch().expect("fetch"))
            .expect("transform");
        assert_eq!(table["k"], "v");
    }
}
