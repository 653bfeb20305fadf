//! # Writer Engine
//!
//! Consumes record streams, validates every record against the resolved
//! schema and serialises accepted records into one target format.
//!
//! ## Shared driver
//!
//! [`WriterSession`] owns grouping and batching for all formats:
//! - records are bucketed by type (and endpoint types for edges) in memory
//! - a bucket's data file is opened on its first flush
//! - buffers flush every `batch_size` records, bounding memory per bucket
//! - data files are written under a hidden temporary name and renamed into
//!   place by [`WriterSession::close`]
//!
//! Formats only implement [`FormatEncoder`]: the header written when a data
//! file opens, the encoding of one record, and companion files produced at
//! close. Adding a format never touches the schema or the sources.

pub mod atoms;
pub mod facts;
pub mod kgx;
pub mod tabular;

use crate::primitives::{
    DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE, PROVENANCE_SOURCE_KEY, PROVENANCE_URL_KEY,
};
use crate::schema::{EffectiveSchema, SchemaSet, Violation};
use crate::types::{
    CancelToken, EdgeRecord, KgError, PropertyValue, Provenance, Record, Representation,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

// =============================================================================
// FORMATS
// =============================================================================

/// Output representations supported by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// Delimited bulk-load files plus idempotent Cypher load scripts.
    #[serde(alias = "neo4j")]
    Tabular,
    /// Parenthesised ground expressions.
    #[serde(alias = "metta")]
    Atoms,
    /// Logic facts.
    #[serde(alias = "prolog")]
    Facts,
    /// KGX JSON lines.
    #[serde(alias = "jsonl")]
    Kgx,
}

impl Format {
    /// Every supported format.
    pub const ALL: [Self; 4] = [Self::Tabular, Self::Atoms, Self::Facts, Self::Kgx];

    /// Encoder implementing this format.
    #[must_use]
    pub fn encoder(self) -> Box<dyn FormatEncoder> {
        match self {
            Self::Tabular => Box::new(tabular::TabularEncoder),
            Self::Atoms => Box::new(atoms::AtomsEncoder),
            Self::Facts => Box::new(facts::FactsEncoder),
            Self::Kgx => Box::new(kgx::KgxEncoder),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tabular => "tabular",
            Self::Atoms => "atoms",
            Self::Facts => "facts",
            Self::Kgx => "kgx",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a bucket: the type plus, for edges, the endpoint labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub representation: Representation,
    /// Schema type name.
    pub type_name: String,
    /// Output label of the type.
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_label: Option<String>,
}

/// Everything an encoder may need about the bucket it is writing.
#[derive(Debug, Clone, Copy)]
pub struct BucketContext<'a> {
    pub key: &'a BucketKey,
    pub schema: &'a EffectiveSchema,
    /// Property columns in output order: effective properties, then provenance.
    pub columns: &'a [String],
    pub batch_size: usize,
    /// Data file path as seen by a loader, relative to the version root.
    pub load_path: &'a str,
}

/// One output format. Implementations are stateless.
pub trait FormatEncoder: Send + Sync {
    fn format(&self) -> Format;

    /// Data file name of a bucket.
    fn data_file(&self, key: &BucketKey) -> String;

    /// Written once when the bucket's data file opens.
    fn open(&self, ctx: &BucketContext<'_>, out: &mut dyn Write) -> io::Result<()>;

    /// Encode one accepted record.
    fn write(&self, ctx: &BucketContext<'_>, record: &Record, out: &mut dyn Write)
    -> io::Result<()>;

    /// Companion files (name, contents) produced when the bucket closes.
    fn close(&self, _ctx: &BucketContext<'_>) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Schema-level document (name, contents) written once per version.
    fn type_definitions(&self, _schema: &SchemaSet) -> Option<(String, String)> {
        None
    }
}

/// Turn a label into something safe inside a file name.
#[must_use]
pub fn file_stem(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Data file name shared by the formats: `nodes_<label>.<ext>` or
/// `edges_<label>_<source>_<target>.<ext>`.
#[must_use]
pub fn bucket_file_name(key: &BucketKey, extension: &str) -> String {
    match key.representation {
        Representation::Node => format!("nodes_{}.{}", file_stem(&key.label), extension),
        Representation::Edge => format!(
            "edges_{}_{}_{}.{}",
            file_stem(&key.label),
            file_stem(key.source_label.as_deref().unwrap_or("any")),
            file_stem(key.target_label.as_deref().unwrap_or("any")),
            extension
        ),
    }
}

/// Stable key of an edge: its own id, else `<source>_<label>_<target>`.
///
/// Edges without an id that carry properties get a digest of those
/// properties appended, so parallel edges only share a key when they are
/// identical.
#[must_use]
pub fn edge_key(edge: &EdgeRecord, label: &str) -> String {
    if let Some(id) = edge.id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let base = format!("{}_{}_{}", edge.source_id, file_stem(label), edge.target_id);
    if edge.properties.is_empty() {
        return base;
    }
    let encoded = serde_json::to_vec(&edge.properties).unwrap_or_default();
    let digest = blake3::hash(&encoded).to_hex();
    format!("{}_{}", base, &digest.as_str()[..16])
}

// =============================================================================
// OPTIONS
// =============================================================================

/// What to do with a node whose id was already written for the same type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Write every record; the loader resolves collisions last-write-wins.
    Allow,
    /// Write every record, but count and log collisions.
    #[default]
    Flag,
    /// Reject records whose id was already seen.
    Reject,
}

impl DuplicatePolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Flag => "flag",
            Self::Reject => "reject",
        }
    }
}

/// Writer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterOptions {
    pub format: Format,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Provenance added to every record as `source` / `source_url`.
    #[serde(default)]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    /// Prefix of data file paths referenced by load scripts.
    #[serde(default)]
    pub load_prefix: String,
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl WriterOptions {
    #[must_use]
    pub fn new(format: Format) -> Self {
        Self {
            format,
            batch_size: DEFAULT_BATCH_SIZE,
            provenance: None,
            duplicate_policy: DuplicatePolicy::default(),
            load_prefix: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), KgError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(KgError::InvalidConfig(format!(
                "batch size {} outside 1..={}",
                self.batch_size, MAX_BATCH_SIZE
            )));
        }
        Ok(())
    }
}

// =============================================================================
// DUPLICATE TRACKING
// =============================================================================

/// Node ids observed per type, shareable by every session of one format.
///
/// Ids are stored as full 256-bit BLAKE3 digests.
#[derive(Debug, Default)]
pub struct IdRegistry {
    seen: Mutex<BTreeMap<String, BTreeSet<[u8; 32]>>>,
}

impl IdRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an id. Returns `false` if it was already present.
    pub fn observe(&self, type_name: &str, id: &str) -> bool {
        let digest = blake3::hash(id.as_bytes());
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.entry(type_name.to_string())
            .or_default()
            .insert(*digest.as_bytes())
    }
}

// =============================================================================
// MANIFEST
// =============================================================================

/// Per-type counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStats {
    pub representation: Representation,
    pub accepted: u64,
    pub rejected: u64,
    #[serde(default)]
    pub duplicates: u64,
    /// Accepted records that carried non-fatal violations.
    #[serde(default)]
    pub warnings: u64,
}

impl TypeStats {
    fn new(representation: Representation) -> Self {
        Self {
            representation,
            accepted: 0,
            rejected: 0,
            duplicates: 0,
            warnings: 0,
        }
    }
}

/// One closed bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketManifest {
    pub key: BucketKey,
    pub records: u64,
    /// Data file first, then companions, relative to the session root.
    pub files: Vec<String>,
}

/// Result of closing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: Format,
    pub types: BTreeMap<String, TypeStats>,
    pub buckets: Vec<BucketManifest>,
    /// Property names observed per type, provenance included.
    pub properties: BTreeMap<String, BTreeSet<String>>,
}

impl Manifest {
    /// Accepted node counts per type.
    #[must_use]
    pub fn node_counts(&self) -> BTreeMap<String, u64> {
        self.counts(Representation::Node)
    }

    /// Accepted edge counts per type.
    #[must_use]
    pub fn edge_counts(&self) -> BTreeMap<String, u64> {
        self.counts(Representation::Edge)
    }

    fn counts(&self, representation: Representation) -> BTreeMap<String, u64> {
        self.types
            .iter()
            .filter(|(_, s)| s.representation == representation && s.accepted > 0)
            .map(|(name, s)| (name.clone(), s.accepted))
            .collect()
    }

    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.types.values().map(|s| s.accepted).sum()
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.types.values().map(|s| s.rejected).sum()
    }

    /// Every file produced, in bucket order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.buckets
            .iter()
            .flat_map(|b| b.files.iter().map(String::as_str))
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Why a record was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub type_name: String,
    pub violations: Vec<Violation>,
    /// Set when the record was dropped by `DuplicatePolicy::Reject`.
    pub duplicate_id: Option<String>,
}

/// Result of [`WriterSession::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    Rejected(Rejection),
}

struct Bucket {
    columns: Vec<String>,
    buffer: Vec<Record>,
    file: Option<BufWriter<File>>,
    temp_path: PathBuf,
    data_file: String,
    load_path: String,
    records: u64,
}

/// A writer session for one output root and one format.
pub struct WriterSession {
    schema: Arc<SchemaSet>,
    root: PathBuf,
    options: WriterOptions,
    encoder: Box<dyn FormatEncoder>,
    buckets: BTreeMap<BucketKey, Bucket>,
    types: BTreeMap<String, TypeStats>,
    properties: BTreeMap<String, BTreeSet<String>>,
    ids: Arc<IdRegistry>,
    cancel: CancelToken,
}

impl fmt::Debug for WriterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSession")
            .field("root", &self.root)
            .field("format", &self.options.format)
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

impl WriterSession {
    /// Open a session. No file is created until a bucket first flushes.
    pub fn open(
        schema: Arc<SchemaSet>,
        output_root: impl Into<PathBuf>,
        options: WriterOptions,
    ) -> Result<Self, KgError> {
        options.validate()?;
        Ok(Self {
            schema,
            root: output_root.into(),
            encoder: options.format.encoder(),
            options,
            buckets: BTreeMap::new(),
            types: BTreeMap::new(),
            properties: BTreeMap::new(),
            ids: Arc::new(IdRegistry::new()),
            cancel: CancelToken::new(),
        })
    }

    /// Share duplicate tracking with other sessions of the same format.
    #[must_use]
    pub fn with_id_registry(mut self, ids: Arc<IdRegistry>) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn format(&self) -> Format {
        self.options.format
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate and buffer one record.
    ///
    /// Schema violations are reported as `WriteOutcome::Rejected`; `Err` is
    /// reserved for I/O failures and cancellation.
    pub fn write(&mut self, record: impl Into<Record>) -> Result<WriteOutcome, KgError> {
        self.cancel.check()?;
        let mut record = record.into();
        let representation = record.representation();

        let violations = self.schema.validate(&record);
        let schema = match self.schema.lookup(record.type_name()) {
            Some(schema) if !violations.iter().any(Violation::is_fatal) => schema,
            _ => {
                let type_name = self
                    .schema
                    .lookup(record.type_name())
                    .map_or_else(|| record.type_name().to_string(), |s| s.name.clone());
                self.types
                    .entry(type_name.clone())
                    .or_insert_with(|| TypeStats::new(representation))
                    .rejected += 1;
                tracing::debug!(type_name = %type_name, violations = ?violations, "record rejected");
                return Ok(WriteOutcome::Rejected(Rejection {
                    type_name,
                    violations,
                    duplicate_id: None,
                }));
            }
        };
        let type_name = schema.name.clone();
        let stats = self
            .types
            .entry(type_name.clone())
            .or_insert_with(|| TypeStats::new(representation));

        if let Record::Node(node) = &record
            && self.options.duplicate_policy != DuplicatePolicy::Allow
            && !self.ids.observe(&type_name, &node.id)
        {
            stats.duplicates += 1;
            tracing::debug!(type_name = %type_name, id = %node.id, "duplicate node id");
            if self.options.duplicate_policy == DuplicatePolicy::Reject {
                stats.rejected += 1;
                return Ok(WriteOutcome::Rejected(Rejection {
                    type_name,
                    violations: Vec::new(),
                    duplicate_id: Some(node.id.clone()),
                }));
            }
        }
        if !violations.is_empty() {
            stats.warnings += 1;
        }
        stats.accepted += 1;

        if let Some(provenance) = &self.options.provenance {
            let props = record.properties_mut();
            props.insert(
                PROVENANCE_SOURCE_KEY.to_string(),
                PropertyValue::String(provenance.dataset.clone()),
            );
            props.insert(
                PROVENANCE_URL_KEY.to_string(),
                PropertyValue::String(provenance.url.clone()),
            );
        }
        let observed = self.properties.entry(type_name.clone()).or_default();
        for key in record.properties().keys() {
            if !observed.contains(key) {
                observed.insert(key.clone());
            }
        }

        let key = self.bucket_key(schema, &record);
        if !self.buckets.contains_key(&key) {
            let bucket = self.new_bucket(&key, schema);
            self.buckets.insert(key.clone(), bucket);
        }
        let full = match self.buckets.get_mut(&key) {
            Some(bucket) => {
                bucket.buffer.push(record);
                bucket.buffer.len() >= self.options.batch_size
            }
            None => false,
        };
        if full {
            self.flush_bucket(&key)?;
        }
        Ok(WriteOutcome::Accepted)
    }

    fn bucket_key(&self, schema: &EffectiveSchema, record: &Record) -> BucketKey {
        let endpoint_label = |type_name: &str| {
            self.schema
                .lookup(type_name)
                .map_or_else(|| type_name.to_string(), |s| s.output_label.clone())
        };
        let (source_label, target_label) = match record {
            Record::Node(_) => (None, None),
            Record::Edge(edge) => (
                Some(endpoint_label(&edge.source_type)),
                Some(endpoint_label(&edge.target_type)),
            ),
        };
        BucketKey {
            representation: schema.representation,
            type_name: schema.name.clone(),
            label: schema.output_label.clone(),
            source_label,
            target_label,
        }
    }

    fn new_bucket(&self, key: &BucketKey, schema: &EffectiveSchema) -> Bucket {
        let mut columns: Vec<String> = schema.property_names().map(str::to_string).collect();
        if self.options.provenance.is_some() {
            for extra in [PROVENANCE_SOURCE_KEY, PROVENANCE_URL_KEY] {
                if !columns.iter().any(|c| c == extra) {
                    columns.push(extra.to_string());
                }
            }
        }
        let data_file = self.encoder.data_file(key);
        let load_path = if self.options.load_prefix.is_empty() {
            data_file.clone()
        } else {
            format!(
                "{}/{}",
                self.options.load_prefix.trim_end_matches('/'),
                data_file
            )
        };
        Bucket {
            columns,
            buffer: Vec::with_capacity(self.options.batch_size.min(DEFAULT_BATCH_SIZE)),
            file: None,
            temp_path: self.root.join(format!(".{}.partial", data_file)),
            data_file,
            load_path,
            records: 0,
        }
    }

    /// Write a bucket's buffered batch. Opens the data file on first use.
    fn flush_bucket(&mut self, key: &BucketKey) -> Result<(), KgError> {
        self.cancel.check()?;
        let Some(schema) = self.schema.lookup(&key.type_name) else {
            return Err(KgError::BuildError(format!(
                "bucket type '{}' vanished from schema",
                key.type_name
            )));
        };
        let Some(bucket) = self.buckets.get_mut(key) else {
            return Ok(());
        };
        if bucket.buffer.is_empty() {
            return Ok(());
        }
        let ctx = BucketContext {
            key,
            schema,
            columns: &bucket.columns,
            batch_size: self.options.batch_size,
            load_path: &bucket.load_path,
        };

        if bucket.file.is_none() {
            fs::create_dir_all(&self.root).map_err(|e| KgError::io(self.root.display(), e))?;
            let file = File::create(&bucket.temp_path)
                .map_err(|e| KgError::io(bucket.temp_path.display(), e))?;
            let mut out = BufWriter::new(file);
            self.encoder
                .open(&ctx, &mut out)
                .map_err(|e| KgError::io(&bucket.data_file, e))?;
            bucket.file = Some(out);
        }
        let Some(out) = bucket.file.as_mut() else {
            return Ok(());
        };
        let batch = std::mem::take(&mut bucket.buffer);
        for record in &batch {
            self.encoder
                .write(&ctx, record, out)
                .map_err(|e| KgError::io(&bucket.data_file, e))?;
        }
        out.flush().map_err(|e| KgError::io(&bucket.data_file, e))?;
        bucket.records += batch.len() as u64;
        tracing::debug!(file = %bucket.data_file, records = batch.len(), "flushed batch");
        Ok(())
    }

    /// Flush every bucket, move data files into place, write companions.
    pub fn close(mut self) -> Result<Manifest, KgError> {
        let keys: Vec<BucketKey> = self.buckets.keys().cloned().collect();
        for key in &keys {
            self.flush_bucket(key)?;
        }

        let mut buckets = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(mut bucket) = self.buckets.remove(&key) else {
                continue;
            };
            let Some(mut out) = bucket.file.take() else {
                continue;
            };
            out.flush()
                .map_err(|e| KgError::io(&bucket.data_file, e))?;
            drop(out);
            let final_path = self.root.join(&bucket.data_file);
            fs::rename(&bucket.temp_path, &final_path)
                .map_err(|e| KgError::io(final_path.display(), e))?;

            let mut files = vec![bucket.data_file.clone()];
            if let Some(schema) = self.schema.lookup(&key.type_name) {
                let ctx = BucketContext {
                    key: &key,
                    schema,
                    columns: &bucket.columns,
                    batch_size: self.options.batch_size,
                    load_path: &bucket.load_path,
                };
                for (name, contents) in self.encoder.close(&ctx) {
                    write_atomic(&self.root.join(&name), contents.as_bytes())?;
                    files.push(name);
                }
            }
            bucket.buffer.clear();
            buckets.push(BucketManifest {
                key,
                records: bucket.records,
                files,
            });
        }

        let manifest = Manifest {
            format: self.options.format,
            types: std::mem::take(&mut self.types),
            buckets,
            properties: std::mem::take(&mut self.properties),
        };
        let duplicates: u64 = manifest.types.values().map(|s| s.duplicates).sum();
        if duplicates > 0 {
            tracing::warn!(
                format = %manifest.format,
                root = %self.root.display(),
                duplicates,
                "duplicate node ids written"
            );
        }
        tracing::info!(
            format = %manifest.format,
            root = %self.root.display(),
            accepted = manifest.accepted(),
            rejected = manifest.rejected(),
            files = manifest.buckets.len(),
            "writer session closed"
        );
        Ok(manifest)
    }

    /// Discard every buffered record and temporary file.
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        for (_, mut bucket) in std::mem::take(&mut self.buckets) {
            drop(bucket.file.take());
            if bucket.temp_path.exists() {
                let _ = fs::remove_file(&bucket.temp_path);
            }
        }
    }
}

impl Drop for WriterSession {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Write a file through a temporary sibling and rename it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), KgError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| KgError::io(parent.display(), e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{}.tmp", name));
    fs::write(&temp, bytes).map_err(|e| KgError::io(temp.display(), e))?;
    fs::rename(&temp, path).map_err(|e| KgError::io(path.display(), e))?;
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EdgeRecord, NodeRecord};

    const DOC: &str = "
gene:
  represented_as: node
  properties:
    chr: str
    start: int
transcript:
  represented_as: node
  properties:
    name: str
transcribed to:
  represented_as: edge
  input_label: transcribed_to
  source: gene
  target: transcript
";

    fn schema() -> Arc<SchemaSet> {
        Arc::new(SchemaSet::load(DOC).expect("schema"))
    }

    fn options(format: Format) -> WriterOptions {
        WriterOptions {
            batch_size: 2,
            ..WriterOptions::new(format)
        }
    }

    #[test]
    fn nothing_is_created_before_first_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("out");
        let mut session =
            WriterSession::open(schema(), &root, options(Format::Atoms)).expect("open");
        session.write(NodeRecord::new("G1", "gene")).expect("write");
        assert!(!root.exists());
        let manifest = session.close().expect("close");
        assert_eq!(manifest.node_counts()["gene"], 1);
        assert!(root.join("nodes_gene.metta").exists());
    }

    #[test]
    fn rejected_records_are_counted_not_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session =
            WriterSession::open(schema(), dir.path(), options(Format::Tabular)).expect("open");

        let bad_edge = EdgeRecord::new("transcribed_to", ("transcript", "T1"), ("gene", "G1"));
        let outcome = session.write(bad_edge).expect("write");
        assert!(matches!(outcome, WriteOutcome::Rejected(_)));

        let unknown = session.write(NodeRecord::new("X", "protein")).expect("write");
        assert!(matches!(unknown, WriteOutcome::Rejected(_)));

        let manifest = session.close().expect("close");
        assert_eq!(manifest.types["transcribed to"].rejected, 1);
        assert_eq!(manifest.types["transcribed to"].accepted, 0);
        assert_eq!(manifest.types["protein"].rejected, 1);
        assert!(manifest.buckets.is_empty());
        assert_eq!(fs::read_dir(dir.path()).expect("read").count(), 0);
    }

    #[test]
    fn batches_flush_at_batch_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session =
            WriterSession::open(schema(), dir.path(), options(Format::Facts)).expect("open");
        for i in 0..5 {
            session
                .write(NodeRecord::new(format!("g{}", i), "gene"))
                .expect("write");
        }
        let bucket = session.buckets.values().next().expect("bucket");
        assert_eq!(bucket.records, 4);
        assert_eq!(bucket.buffer.len(), 1);
        let manifest = session.close().expect("close");
        assert_eq!(manifest.buckets[0].records, 5);
    }

    #[test]
    fn duplicate_ids_are_flagged_or_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut flag =
            WriterSession::open(schema(), dir.path().join("a"), options(Format::Atoms))
                .expect("open");
        flag.write(NodeRecord::new("G1", "gene")).expect("write");
        flag.write(NodeRecord::new("G1", "gene")).expect("write");
        let manifest = flag.close().expect("close");
        assert_eq!(manifest.types["gene"].accepted, 2);
        assert_eq!(manifest.types["gene"].duplicates, 1);

        let mut reject = WriterSession::open(
            schema(),
            dir.path().join("b"),
            WriterOptions {
                duplicate_policy: DuplicatePolicy::Reject,
                ..options(Format::Atoms)
            },
        )
        .expect("open");
        reject.write(NodeRecord::new("G1", "gene")).expect("write");
        let second = reject.write(NodeRecord::new("G1", "gene")).expect("write");
        assert!(matches!(
            second,
            WriteOutcome::Rejected(Rejection { duplicate_id: Some(_), .. })
        ));
    }

    #[test]
    fn shared_registry_sees_other_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ids = Arc::new(IdRegistry::new());
        let mut first = WriterSession::open(schema(), dir.path().join("a"), options(Format::Atoms))
            .expect("open")
            .with_id_registry(Arc::clone(&ids));
        first.write(NodeRecord::new("G1", "gene")).expect("write");
        first.close().expect("close");

        let mut second = WriterSession::open(schema(), dir.path().join("b"), options(Format::Atoms))
            .expect("open")
            .with_id_registry(ids);
        second.write(NodeRecord::new("G1", "gene")).expect("write");
        let manifest = second.close().expect("close");
        assert_eq!(manifest.types["gene"].duplicates, 1);
    }

    #[test]
    fn registry_keeps_distinct_ids_apart() {
        let ids = IdRegistry::new();
        for i in 0..20_000 {
            assert!(ids.observe("gene", &format!("ENSG{:011}", i)), "{}", i);
        }
        assert!(!ids.observe("gene", "ENSG00000000042"));
        assert!(ids.observe("transcript", "ENSG00000000042"));
    }

    #[test]
    fn edge_keys_separate_parallel_edges() {
        let plain = EdgeRecord::new("regulates", ("gene", "G1"), ("gene", "G2"));
        assert_eq!(edge_key(&plain, "regulates"), "G1_regulates_G2");

        let strong = plain.clone().with("score", 0.9);
        let weak = plain.clone().with("score", 0.1);
        assert_ne!(edge_key(&strong, "regulates"), edge_key(&weak, "regulates"));
        assert_eq!(edge_key(&strong, "regulates"), edge_key(&strong.clone(), "regulates"));

        let mut named = plain;
        named.id = Some("E7".into());
        assert_eq!(edge_key(&named, "regulates"), "E7");
    }

    #[test]
    fn provenance_is_added_to_every_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session = WriterSession::open(
            schema(),
            dir.path(),
            WriterOptions {
                provenance: Some(Provenance {
                    dataset: "GENCODE".into(),
                    url: "https://example.org/gencode".into(),
                    version: None,
                }),
                ..options(Format::Tabular)
            },
        )
        .expect("open");
        session
            .write(NodeRecord::new("G1", "gene").with("chr", "chr1"))
            .expect("write");
        let manifest = session.close().expect("close");
        assert!(manifest.properties["gene"].contains(PROVENANCE_SOURCE_KEY));
        let csv = fs::read_to_string(dir.path().join("nodes_gene.csv")).expect("csv");
        assert_eq!(
            csv,
            "id|chr|start|source|source_url\nG1|chr1||GENCODE|https://example.org/gencode\n"
        );
    }

    #[test]
    fn cancelled_session_leaves_no_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        let mut session = WriterSession::open(schema(), dir.path(), options(Format::Atoms))
            .expect("open")
            .with_cancel(cancel.clone());
        for i in 0..3 {
            session
                .write(NodeRecord::new(format!("g{}", i), "gene"))
                .expect("write");
        }
        cancel.cancel();
        assert!(matches!(
            session.write(NodeRecord::new("g9", "gene")),
            Err(KgError::Cancelled)
        ));
        session.abort();
        assert_eq!(fs::read_dir(dir.path()).expect("read").count(), 0);
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = WriterSession::open(
            schema(),
            dir.path(),
            WriterOptions {
                batch_size: 0,
                ..WriterOptions::new(Format::Atoms)
            },
        );
        assert!(matches!(result, Err(KgError::InvalidConfig(_))));
    }

    #[test]
    fn edge_buckets_are_named_by_triple() {
        let key = BucketKey {
            representation: Representation::Edge,
            type_name: "transcribed to".into(),
            label: "transcribed to".into(),
            source_label: Some("gene".into()),
            target_label: Some("transcript".into()),
        };
        assert_eq!(
            bucket_file_name(&key, "csv"),
            "edges_transcribed_to_gene_transcript.csv"
        );
    }
}
