//! # Schema Resolver
//!
//! Parses the declarative type-hierarchy document and resolves it into an
//! immutable [`SchemaSet`]: one [`EffectiveSchema`] per declared type with
//! inherited properties, the ancestor closure and edge endpoint constraints.
//!
//! ## Document shape
//!
//! ```yaml
//! biological entity:
//!   represented_as: node
//!   properties:
//!     name: str
//! gene:
//!   is_a: biological entity
//!   represented_as: node
//!   inherit_properties: true
//!   input_label: gene
//!   properties:
//!     chr: str
//!     start: int
//! transcribed to:
//!   is_a: [regulatory association]
//!   represented_as: edge
//!   source: gene
//!   target: transcript
//! ```
//!
//! The parent graph is a DAG. Resolution runs once per document; a changed
//! document is simply loaded again.

use crate::types::{
    EdgeRecord, KgError, NodeRecord, Record, Representation, SchemaError, SemanticType,
};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::Path;
use thiserror::Error;

// =============================================================================
// DOCUMENT MODEL
// =============================================================================

/// A declared property: name plus semantic type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyDecl {
    pub name: String,
    pub semantic_type: SemanticType,
}

/// Ordered property declarations.
///
/// YAML mappings are read in document order; that order is what the
/// symbolic-atoms and logic-facts writers use for argument positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyDecls(pub Vec<PropertyDecl>);

impl<'de> Deserialize<'de> for PropertyDecls {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DeclVisitor;

        impl<'de> Visitor<'de> for DeclVisitor {
            type Value = PropertyDecls;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of property name to semantic type")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(PropertyDecls::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut decls: Vec<PropertyDecl> = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, semantic_type)) = map.next_entry::<String, SemanticType>()? {
                    if decls.iter().any(|d| d.name == name) {
                        return Err(de::Error::custom(format!("duplicate property '{}'", name)));
                    }
                    decls.push(PropertyDecl {
                        name,
                        semantic_type,
                    });
                }
                Ok(PropertyDecls(decls))
            }
        }

        deserializer.deserialize_any(DeclVisitor)
    }
}

/// `is_a`, `source` and `target` accept a single name or a list of names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(name)) => vec![name],
        Some(OneOrMany::Many(names)) => names,
    })
}

/// One entry of the schema document.
#[derive(Debug, Clone, Deserialize)]
pub struct TypeDefinition {
    #[serde(default, deserialize_with = "one_or_many")]
    pub is_a: Vec<String>,
    pub represented_as: Representation,
    #[serde(default)]
    pub properties: PropertyDecls,
    #[serde(default)]
    pub inherit_properties: bool,
    #[serde(default)]
    pub input_label: Option<String>,
    #[serde(default)]
    pub output_label: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub source: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub target: Vec<String>,
}

// =============================================================================
// EFFECTIVE SCHEMA
// =============================================================================

/// Fully resolved view of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveSchema {
    pub name: String,
    pub representation: Representation,
    pub input_label: String,
    pub output_label: String,
    /// Direct parents in declaration order.
    pub parents: Vec<String>,
    /// Own plus inherited properties, nearest declaration first.
    pub properties: Vec<PropertyDecl>,
    /// Every ancestor including the type itself.
    pub ancestors: BTreeSet<String>,
    /// Allowed source types (edges only).
    pub source_types: Vec<String>,
    /// Allowed target types (edges only).
    pub target_types: Vec<String>,
}

impl EffectiveSchema {
    #[must_use]
    pub fn property_type(&self, name: &str) -> Option<SemanticType> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.semantic_type)
    }

    #[must_use]
    pub fn is_edge(&self) -> bool {
        self.representation == Representation::Edge
    }

    /// Property names in effective order.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }
}

// =============================================================================
// VIOLATIONS
// =============================================================================

/// Which end of an edge a violation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Source,
    Target,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// A reason a record does not satisfy the schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("type '{type_name}' is not represented as {expected}")]
    RepresentationMismatch {
        type_name: String,
        expected: Representation,
    },

    #[error("record of type '{type_name}' has an empty id")]
    MissingId { type_name: String },

    #[error("{endpoint} type '{found}' of edge '{edge_type}' is not one of {allowed:?}")]
    EndpointMismatch {
        edge_type: String,
        endpoint: Endpoint,
        found: String,
        allowed: Vec<String>,
    },

    #[error("property '{property}' is not declared for '{type_name}'")]
    UnknownProperty { type_name: String, property: String },

    #[error("property '{property}' of '{type_name}' expected {expected}, found {found}")]
    PropertyTypeMismatch {
        type_name: String,
        property: String,
        expected: SemanticType,
        found: SemanticType,
    },
}

impl Violation {
    /// Fatal violations cause the record to be rejected; the rest are warnings.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::PropertyTypeMismatch { .. })
    }
}

// =============================================================================
// SCHEMA SET
// =============================================================================

/// The resolved schema: every declared type keyed by name.
#[derive(Debug, Clone)]
pub struct SchemaSet {
    types: BTreeMap<String, EffectiveSchema>,
    /// input label -> type name, for labels that differ from the name.
    labels: BTreeMap<String, String>,
    fingerprint: String,
}

impl SchemaSet {
    /// Parse and resolve a schema document.
    pub fn load(document: &str) -> Result<Self, SchemaError> {
        let defs: BTreeMap<String, TypeDefinition> =
            serde_yaml::from_str(document).map_err(|e| SchemaError::Parse(e.to_string()))?;
        Self::from_definitions(defs, fingerprint_bytes(document.as_bytes()))
    }

    /// Read a schema document from disk and resolve it.
    pub fn load_path(path: impl AsRef<Path>) -> Result<Self, KgError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|e| KgError::io(path.display(), e))?;
        Ok(Self::load(&document)?)
    }

    fn from_definitions(
        defs: BTreeMap<String, TypeDefinition>,
        fingerprint: String,
    ) -> Result<Self, SchemaError> {
        for (name, def) in &defs {
            if name.trim().is_empty() {
                return Err(SchemaError::InvalidType {
                    name: name.clone(),
                    reason: "type name is empty".to_string(),
                });
            }
            for parent in &def.is_a {
                if !defs.contains_key(parent) {
                    return Err(SchemaError::UnknownParent {
                        child: name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        let order = topological_order(&defs)?;

        let mut labels = BTreeMap::new();
        for (name, def) in &defs {
            if let Some(label) = &def.input_label
                && label != name
                && !defs.contains_key(label)
            {
                labels.insert(label.clone(), name.clone());
            }
        }

        // Ancestor closure and endpoints need parents resolved first.
        let mut types: BTreeMap<String, EffectiveSchema> = BTreeMap::new();
        for name in &order {
            let Some(def) = defs.get(name) else {
                continue;
            };
            let mut ancestors = BTreeSet::new();
            ancestors.insert(name.clone());
            for parent in &def.is_a {
                if let Some(resolved) = types.get(parent) {
                    ancestors.extend(resolved.ancestors.iter().cloned());
                }
            }

            let (source_types, target_types) = if def.represented_as == Representation::Edge {
                resolve_endpoints(name, def, &types)?
            } else {
                (Vec::new(), Vec::new())
            };

            let input_label = def.input_label.clone().unwrap_or_else(|| name.clone());
            let output_label = def
                .output_label
                .clone()
                .unwrap_or_else(|| input_label.clone());

            types.insert(
                name.clone(),
                EffectiveSchema {
                    name: name.clone(),
                    representation: def.represented_as,
                    input_label,
                    output_label,
                    parents: def.is_a.clone(),
                    properties: effective_properties(name, &defs),
                    ancestors,
                    source_types,
                    target_types,
                },
            );
        }

        // Endpoints must be node types, checked once every type is resolved.
        for schema in types.values().filter(|t| t.is_edge()) {
            for endpoint in schema.source_types.iter().chain(&schema.target_types) {
                match types.get(endpoint) {
                    Some(t) if t.representation == Representation::Node => {}
                    Some(_) => {
                        return Err(SchemaError::MissingEndpoints {
                            edge: schema.name.clone(),
                            reason: format!("endpoint '{}' is not a node type", endpoint),
                        });
                    }
                    None => {
                        return Err(SchemaError::MissingEndpoints {
                            edge: schema.name.clone(),
                            reason: format!("endpoint '{}' is not declared", endpoint),
                        });
                    }
                }
            }
        }

        Ok(Self {
            types,
            labels,
            fingerprint,
        })
    }

    /// Look up a type by name or input label.
    #[must_use]
    pub fn lookup(&self, type_name: &str) -> Option<&EffectiveSchema> {
        self.types.get(type_name).or_else(|| {
            self.labels
                .get(type_name)
                .and_then(|name| self.types.get(name))
        })
    }

    /// Resolve a type by name or input label.
    pub fn resolve(&self, type_name: &str) -> Result<&EffectiveSchema, SchemaError> {
        self.lookup(type_name)
            .ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))
    }

    #[must_use]
    pub fn is_edge_type(&self, type_name: &str) -> bool {
        self.lookup(type_name).is_some_and(EffectiveSchema::is_edge)
    }

    /// Whether `child` is `ancestor` or transitively inherits from it.
    #[must_use]
    pub fn is_a(&self, child: &str, ancestor: &str) -> bool {
        let Some(ancestor) = self.lookup(ancestor) else {
            return false;
        };
        self.lookup(child)
            .is_some_and(|c| c.ancestors.contains(&ancestor.name))
    }

    /// BLAKE3 digest of the document this set was loaded from.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// All resolved types in name order.
    pub fn types(&self) -> impl Iterator<Item = &EffectiveSchema> {
        self.types.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Check a record against the schema. Never fails; returns every violation.
    #[must_use]
    pub fn validate(&self, record: &Record) -> Vec<Violation> {
        match record {
            Record::Node(node) => self.validate_node(node),
            Record::Edge(edge) => self.validate_edge(edge),
        }
    }

    fn validate_node(&self, node: &NodeRecord) -> Vec<Violation> {
        let Some(schema) = self.lookup(&node.node_type) else {
            return vec![Violation::UnknownType(node.node_type.clone())];
        };
        let mut violations = Vec::new();
        if schema.representation != Representation::Node {
            violations.push(Violation::RepresentationMismatch {
                type_name: schema.name.clone(),
                expected: Representation::Node,
            });
        }
        if node.id.trim().is_empty() {
            violations.push(Violation::MissingId {
                type_name: schema.name.clone(),
            });
        }
        check_properties(schema, &node.properties, &mut violations);
        violations
    }

    fn validate_edge(&self, edge: &EdgeRecord) -> Vec<Violation> {
        let Some(schema) = self.lookup(&edge.edge_type) else {
            return vec![Violation::UnknownType(edge.edge_type.clone())];
        };
        let mut violations = Vec::new();
        if schema.representation != Representation::Edge {
            violations.push(Violation::RepresentationMismatch {
                type_name: schema.name.clone(),
                expected: Representation::Edge,
            });
            return violations;
        }
        if edge.source_id.trim().is_empty() || edge.target_id.trim().is_empty() {
            violations.push(Violation::MissingId {
                type_name: schema.name.clone(),
            });
        }
        for (endpoint, found, allowed) in [
            (Endpoint::Source, &edge.source_type, &schema.source_types),
            (Endpoint::Target, &edge.target_type, &schema.target_types),
        ] {
            let matches = allowed.iter().any(|a| self.is_a(found, a));
            if !matches {
                violations.push(Violation::EndpointMismatch {
                    edge_type: schema.name.clone(),
                    endpoint,
                    found: found.clone(),
                    allowed: allowed.clone(),
                });
            }
        }
        check_properties(schema, &edge.properties, &mut violations);
        violations
    }
}

fn check_properties(
    schema: &EffectiveSchema,
    properties: &crate::types::Properties,
    violations: &mut Vec<Violation>,
) {
    for (key, value) in properties {
        match schema.property_type(key) {
            None => violations.push(Violation::UnknownProperty {
                type_name: schema.name.clone(),
                property: key.clone(),
            }),
            Some(expected) if !value.conforms_to(expected) => {
                violations.push(Violation::PropertyTypeMismatch {
                    type_name: schema.name.clone(),
                    property: key.clone(),
                    expected,
                    found: value.semantic_type(),
                });
            }
            Some(_) => {}
        }
    }
}

/// Hex BLAKE3 digest.
#[must_use]
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

// =============================================================================
// RESOLUTION HELPERS
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first post-order over the parent graph: parents before children.
fn topological_order(defs: &BTreeMap<String, TypeDefinition>) -> Result<Vec<String>, SchemaError> {
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut order = Vec::with_capacity(defs.len());
    for name in defs.keys() {
        visit(name, defs, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

fn visit<'a>(
    name: &'a str,
    defs: &'a BTreeMap<String, TypeDefinition>,
    marks: &mut BTreeMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<(), SchemaError> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| *n == name).unwrap_or(0);
            let mut path: Vec<String> = stack[start..].iter().map(|n| (*n).to_string()).collect();
            path.push(name.to_string());
            return Err(SchemaError::Cycle(path));
        }
        None => {}
    }

    marks.insert(name, Mark::Visiting);
    stack.push(name);
    if let Some(def) = defs.get(name) {
        for parent in &def.is_a {
            visit(parent, defs, marks, stack, order)?;
        }
    }
    stack.pop();
    marks.insert(name, Mark::Done);
    order.push(name.to_string());
    Ok(())
}

/// Own properties, then ancestors breadth-first (nearest level first, parents
/// in declaration order). The first declaration of a name wins.
fn effective_properties(name: &str, defs: &BTreeMap<String, TypeDefinition>) -> Vec<PropertyDecl> {
    let Some(def) = defs.get(name) else {
        return Vec::new();
    };
    let mut properties = def.properties.0.clone();
    if !def.inherit_properties {
        return properties;
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    seen.insert(name);
    let mut queue: VecDeque<&str> = def.is_a.iter().map(String::as_str).collect();
    while let Some(ancestor) = queue.pop_front() {
        if !seen.insert(ancestor) {
            continue;
        }
        let Some(ancestor_def) = defs.get(ancestor) else {
            continue;
        };
        for decl in &ancestor_def.properties.0 {
            if !properties.iter().any(|p| p.name == decl.name) {
                properties.push(decl.clone());
            }
        }
        queue.extend(ancestor_def.is_a.iter().map(String::as_str));
    }
    properties
}

/// Declared endpoints, or the nearest edge ancestor's when omitted.
fn resolve_endpoints(
    name: &str,
    def: &TypeDefinition,
    resolved: &BTreeMap<String, EffectiveSchema>,
) -> Result<(Vec<String>, Vec<String>), SchemaError> {
    let inherited = def
        .is_a
        .iter()
        .filter_map(|p| resolved.get(p))
        .find(|p| p.is_edge() && !p.source_types.is_empty() && !p.target_types.is_empty());

    let source = if def.source.is_empty() {
        inherited.map(|p| p.source_types.clone()).unwrap_or_default()
    } else {
        def.source.clone()
    };
    let target = if def.target.is_empty() {
        inherited.map(|p| p.target_types.clone()).unwrap_or_default()
    } else {
        def.target.clone()
    };

    if source.is_empty() || target.is_empty() {
        return Err(SchemaError::MissingEndpoints {
            edge: name.to_string(),
            reason: "source and target types are required".to_string(),
        });
    }
    Ok((source, target))
}

// =============================================================================
// TESTS
// =============================================================================
