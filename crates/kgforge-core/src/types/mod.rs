//! # Core Type Definitions
//!
//! This module contains the record model shared by every other module:
//! - Property values and their semantic types (`PropertyValue`, `SemanticType`)
//! - Node and edge records (`NodeRecord`, `EdgeRecord`, `Record`)
//! - Provenance attached to a source (`Provenance`)
//! - Error types (`KgError`, `SchemaError`, `MappingError`)
//!
//! ## Determinism Guarantees
//!
//! Property maps are `BTreeMap`s, so iteration order never depends on the
//! order in which a source happened to insert keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

// =============================================================================
// PROPERTY VALUES
// =============================================================================

/// Semantic type of a declared property.
///
/// The schema document spells these `str`, `int`, `float`, `str[]` and
/// `float[]`; long-form aliases are accepted as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SemanticType {
    #[serde(rename = "str", alias = "string")]
    String,
    #[serde(rename = "int", alias = "integer")]
    Integer,
    #[serde(rename = "float", alias = "double")]
    Float,
    #[serde(rename = "str[]", alias = "string[]")]
    StringList,
    #[serde(rename = "float[]", alias = "double[]")]
    FloatList,
}

impl SemanticType {
    /// Name used in the schema document.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "str",
            Self::Integer => "int",
            Self::Float => "float",
            Self::StringList => "str[]",
            Self::FloatList => "float[]",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single property value carried by a record.
///
/// Absent values are represented by leaving the key out of the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Integer(i64),
    Float(f64),
    String(String),
    StringList(Vec<String>),
    FloatList(Vec<f64>),
}

impl PropertyValue {
    /// Semantic type this value naturally carries.
    #[must_use]
    pub const fn semantic_type(&self) -> SemanticType {
        match self {
            Self::Integer(_) => SemanticType::Integer,
            Self::Float(_) => SemanticType::Float,
            Self::String(_) => SemanticType::String,
            Self::StringList(_) => SemanticType::StringList,
            Self::FloatList(_) => SemanticType::FloatList,
        }
    }

    /// Whether this value is acceptable for a property declared as `expected`.
    ///
    /// Integers are accepted where floats are declared, and an empty list
    /// matches either list type.
    #[must_use]
    pub fn conforms_to(&self, expected: SemanticType) -> bool {
        match (self, expected) {
            (Self::Integer(_), SemanticType::Float) => true,
            (Self::StringList(v), SemanticType::FloatList) => v.is_empty(),
            (Self::FloatList(v), SemanticType::StringList) => v.is_empty(),
            _ => self.semantic_type() == expected,
        }
    }

    /// True for empty strings and empty lists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::String(s) => s.is_empty(),
            Self::StringList(v) => v.is_empty(),
            Self::FloatList(v) => v.is_empty(),
            Self::Integer(_) | Self::Float(_) => false,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(v: Vec<String>) -> Self {
        Self::StringList(v)
    }
}

/// Property map of a record.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Deserialize a property map, dropping keys whose value is `null`.
fn present_properties<'de, D>(deserializer: D) -> Result<Properties, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, Option<PropertyValue>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect())
}

// =============================================================================
// RECORDS
// =============================================================================

/// A node instance produced by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    /// Type name or input label from the schema.
    #[serde(rename = "type", alias = "label")]
    pub node_type: String,
    #[serde(default, deserialize_with = "present_properties")]
    pub properties: Properties,
}

impl NodeRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            properties: Properties::new(),
        }
    }

    /// Builder-style property insertion.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An edge instance produced by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Optional edge id; many sources leave it empty.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", alias = "label")]
    pub edge_type: String,
    pub source_id: String,
    pub source_type: String,
    pub target_id: String,
    pub target_type: String,
    #[serde(default, deserialize_with = "present_properties")]
    pub properties: Properties,
}

impl EdgeRecord {
    #[must_use]
    pub fn new(
        edge_type: impl Into<String>,
        (source_type, source_id): (&str, &str),
        (target_type, target_id): (&str, &str),
    ) -> Self {
        Self {
            id: None,
            edge_type: edge_type.into(),
            source_id: source_id.to_string(),
            source_type: source_type.to_string(),
            target_id: target_id.to_string(),
            target_type: target_type.to_string(),
            properties: Properties::new(),
        }
    }

    /// Builder-style property insertion.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Either kind of record, as consumed by the writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Node(NodeRecord),
    Edge(EdgeRecord),
}

impl Record {
    /// The type name or label the record claims.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Node(n) => &n.node_type,
            Self::Edge(e) => &e.edge_type,
        }
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        match self {
            Self::Node(n) => &n.properties,
            Self::Edge(e) => &e.properties,
        }
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        match self {
            Self::Node(n) => &mut n.properties,
            Self::Edge(e) => &mut e.properties,
        }
    }

    #[must_use]
    pub const fn representation(&self) -> Representation {
        match self {
            Self::Node(_) => Representation::Node,
            Self::Edge(_) => Representation::Edge,
        }
    }
}

impl From<NodeRecord> for Record {
    fn from(n: NodeRecord) -> Self {
        Self::Node(n)
    }
}

impl From<EdgeRecord> for Record {
    fn from(e: EdgeRecord) -> Self {
        Self::Edge(e)
    }
}

/// How a schema type is represented in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    Node,
    Edge,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => f.write_str("node"),
            Self::Edge => f.write_str("edge"),
        }
    }
}

// =============================================================================
// PROVENANCE
// =============================================================================

/// Dataset provenance configured for a source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Provenance {
    /// Dataset name, written as the `source` property.
    pub dataset: String,
    /// Dataset URL, written as the `source_url` property.
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

// =============================================================================
// CANCELLATION
// =============================================================================

/// Shared stop flag. Checked between records and before each batch flush.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(KgError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), KgError> {
        if self.is_cancelled() {
            Err(KgError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors raised while loading a schema document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// The document is not valid YAML or not a mapping of type definitions.
    #[error("Schema parse error: {0}")]
    Parse(String),

    /// A type references a parent that is not declared.
    #[error("Type '{child}' references undeclared parent '{parent}'")]
    UnknownParent { child: String, parent: String },

    /// The parent graph contains a cycle. The path lists the types on it.
    #[error("Cycle in type hierarchy: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// An edge type omits its endpoints or they are not node types.
    #[error("Edge type '{edge}' has missing or unresolvable endpoints: {reason}")]
    MissingEndpoints { edge: String, reason: String },

    /// A type entry is structurally invalid.
    #[error("Invalid type definition '{name}': {reason}")]
    InvalidType { name: String, reason: String },

    /// A requested type is not declared.
    #[error("Unknown type: {0}")]
    UnknownType(String),
}

/// Errors raised by identifier mapping refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// Fetching the raw mapping payload failed.
    #[error("Mapping '{name}' fetch failed: {reason}")]
    Fetch { name: String, reason: String },

    /// The payload could not be turned into a key/value table.
    #[error("Mapping '{name}' transform failed: {reason}")]
    Transform { name: String, reason: String },

    /// No table is loaded and none could be fetched.
    #[error("Mapping '{0}' has no cached table and could not be refreshed")]
    Unavailable(String),

    /// The persisted cache could not be read or written.
    #[error("Mapping '{name}' store error: {reason}")]
    Store { name: String, reason: String },
}

/// Errors that can occur in kgforge.
///
/// - No silent failures
/// - Use `Result<T, KgError>` for fallible operations
/// - Rejected records are not errors; see `writer::WriteOutcome`
#[derive(Debug, Error)]
pub enum KgError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// A source failed while producing records.
    #[error("Source '{source_name}' failed: {reason}")]
    Source { source_name: String, reason: String },

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Finalising a build failed.
    #[error("Build error: {0}")]
    BuildError(String),

    /// The operation observed a cancellation request.
    #[error("Cancelled")]
    Cancelled,

    /// Configuration values are inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl KgError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        Self::IoError(format!("{}: {}", context, err))
    }
}

impl From<std::io::Error> for KgError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for KgError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
