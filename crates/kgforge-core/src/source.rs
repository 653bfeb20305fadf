//! # Source Protocol
//!
//! The boundary every external data source implements. A source exposes two
//! independent, finite, single-pass lazy sequences of records. The core never
//! rewinds them; a retried build asks the [`SourceProvider`] for a fresh
//! [`Source`].
//!
//! No ordering is promised between sources and node ids need not be unique
//! across them. Duplicate ids are first observed by the writer.

use crate::types::{EdgeRecord, KgError, NodeRecord, Provenance};
use serde::{Deserialize, Serialize};

/// Lazy stream of records from one source.
pub type RecordStream<'a, T> = Box<dyn Iterator<Item = Result<T, KgError>> + Send + 'a>;

/// A source opened for one build attempt.
pub trait Source: Send {
    /// Node records. Called at most once per opened source.
    fn nodes(&mut self) -> Result<RecordStream<'_, NodeRecord>, KgError>;

    /// Edge records. Called at most once per opened source.
    fn edges(&mut self) -> Result<RecordStream<'_, EdgeRecord>, KgError>;
}

/// Static description of a configured source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Unique source name.
    pub name: String,
    /// Output partition (subdirectory) exclusively owned by this source.
    pub partition: String,
    /// Digest of the source's configuration; a change marks the source dirty
    /// for incremental builds.
    pub fingerprint: String,
    #[serde(default = "enabled")]
    pub write_nodes: bool,
    #[serde(default = "enabled")]
    pub write_edges: bool,
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

const fn enabled() -> bool {
    true
}

/// Opens fresh [`Source`] instances for the build controller.
pub trait SourceProvider: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    fn open(&self) -> Result<Box<dyn Source>, KgError>;
}

/// In-memory source, mostly useful for tests and small fixed datasets.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
}

impl VecSource {
    #[must_use]
    pub fn new(nodes: Vec<NodeRecord>, edges: Vec<EdgeRecord>) -> Self {
        Self { nodes, edges }
    }
}

impl Source for VecSource {
    fn nodes(&mut self) -> Result<RecordStream<'_, NodeRecord>, KgError> {
        Ok(Box::new(std::mem::take(&mut self.nodes).into_iter().map(Ok)))
    }

    fn edges(&mut self) -> Result<RecordStream<'_, EdgeRecord>, KgError> {
        Ok(Box::new(std::mem::take(&mut self.edges).into_iter().map(Ok)))
    }
}

/// Provider that hands out clones of a fixed [`VecSource`].
#[derive(Debug, Clone)]
pub struct StaticProvider {
    descriptor: SourceDescriptor,
    data: VecSource,
}

impl StaticProvider {
    #[must_use]
    pub fn new(descriptor: SourceDescriptor, data: VecSource) -> Self {
        Self { descriptor, data }
    }
}

impl SourceProvider for StaticProvider {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn open(&self) -> Result<Box<dyn Source>, KgError> {
        Ok(Box::new(self.data.clone()))
    }
}

// =============================================================================
// ID NORMALISATION
// =============================================================================

/// Normalise a node id for emission.
///
/// `PREFIX:LOCAL` curies keep both parts joined with `_` when the prefix is an
/// ontology namespace (`GO`, `HP`, ...); other prefixed ids keep only the
/// local part. Spaces become `_` and the result is upper-cased.
#[must_use]
pub fn normalize_node_id(id: &str, keep_prefix: bool) -> String {
    let trimmed = id.trim();
    let joined = match trimmed.split_once(':') {
        Some((prefix, local)) if keep_prefix => format!("{}_{}", prefix, local),
        Some((_, local)) => local.to_string(),
        None => trimmed.to_string(),
    };
    joined.replace(' ', "_").to_uppercase()
}

// =============================================================================
// TESTS
// =============================================================================
