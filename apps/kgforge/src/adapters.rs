//! # JSON-Lines Adapter
//!
//! Reads node and edge records from newline-delimited JSON files, one record
//! per line:
//!
//! ```text
//! {"id": "ENSG00000141510", "type": "gene", "properties": {"name": "TP53"}}
//! {"type": "transcribed_to", "source_id": "ENSG00000141510", "source_type": "gene", ...}
//! ```
//!
//! Ids can be normalised and then translated through an identifier mapping.
//! Malformed lines fail the source with the file and line number.

use crate::config::SourceConfig;
use kgforge_core::source::{RecordStream, normalize_node_id};
use kgforge_core::{
    EdgeRecord, KgError, MappingCache, NodeRecord, Source, SourceDescriptor, SourceProvider,
};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// PROVIDER
// =============================================================================

pub struct JsonLinesProvider {
    descriptor: SourceDescriptor,
    config: SourceConfig,
    mapping: Option<Arc<MappingCache>>,
}

impl JsonLinesProvider {
    #[must_use]
    pub fn new(
        descriptor: SourceDescriptor,
        config: SourceConfig,
        mapping: Option<Arc<MappingCache>>,
    ) -> Self {
        Self {
            descriptor,
            config,
            mapping,
        }
    }
}

impl SourceProvider for JsonLinesProvider {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn open(&self) -> Result<Box<dyn Source>, KgError> {
        Ok(Box::new(JsonLinesSource {
            name: self.config.name.clone(),
            nodes_file: self.config.nodes_file.clone(),
            edges_file: self.config.edges_file.clone(),
            ids: IdTranslator {
                normalize: self.config.normalize_ids,
                keep_prefix: self.config.keep_prefix,
                mapping: self.mapping.clone(),
            },
        }))
    }
}

// =============================================================================
// SOURCE
// =============================================================================

struct JsonLinesSource {
    name: String,
    nodes_file: Option<PathBuf>,
    edges_file: Option<PathBuf>,
    ids: IdTranslator,
}

impl Source for JsonLinesSource {
    fn nodes(&mut self) -> Result<RecordStream<'_, NodeRecord>, KgError> {
        let ids = &self.ids;
        let lines = read_lines::<NodeRecord>(&self.name, self.nodes_file.as_deref())?;
        Ok(Box::new(lines.map(move |record| {
            record.map(|mut node| {
                node.id = ids.translate(&node.id);
                node
            })
        })))
    }

    fn edges(&mut self) -> Result<RecordStream<'_, EdgeRecord>, KgError> {
        let ids = &self.ids;
        let lines = read_lines::<EdgeRecord>(&self.name, self.edges_file.as_deref())?;
        Ok(Box::new(lines.map(move |record| {
            record.map(|mut edge| {
                edge.source_id = ids.translate(&edge.source_id);
                edge.target_id = ids.translate(&edge.target_id);
                edge
            })
        })))
    }
}

/// Stream records from `path`, skipping blank lines. No file, no records.
fn read_lines<T: DeserializeOwned + Send + 'static>(
    source: &str,
    path: Option<&Path>,
) -> Result<RecordStream<'static, T>, KgError> {
    let Some(path) = path else {
        return Ok(Box::new(std::iter::empty()));
    };
    let file = File::open(path).map_err(|e| KgError::Source {
        source_name: source.to_string(),
        reason: format!("{}: {}", path.display(), e),
    })?;

    let source = source.to_string();
    let display = path.display().to_string();
    let records = BufReader::new(file)
        .lines()
        .enumerate()
        .filter_map(move |(index, line)| {
            let fail = |reason: String| KgError::Source {
                source_name: source.clone(),
                reason: format!("{}:{}: {}", display, index + 1, reason),
            };
            match line {
                Ok(text) if text.trim().is_empty() => None,
                Ok(text) => Some(serde_json::from_str::<T>(&text).map_err(|e| fail(e.to_string()))),
                Err(e) => Some(Err(fail(e.to_string()))),
            }
        });
    Ok(Box::new(records))
}

// =============================================================================
// ID TRANSLATION
// =============================================================================

struct IdTranslator {
    normalize: bool,
    keep_prefix: bool,
    mapping: Option<Arc<MappingCache>>,
}

impl IdTranslator {
    fn translate(&self, id: &str) -> String {
        let id = if self.normalize {
            normalize_node_id(id, self.keep_prefix)
        } else {
            id.to_string()
        };
        match &self.mapping {
            Some(cache) => cache.lookup(&id).unwrap_or(id),
            None => id,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
