//! # Symbolic-Atoms Format
//!
//! One ground expression per record:
//!
//! ```text
//! (gene ENSG00000141510 (chr chr17) (start 7661779))
//! (transcribed_to (gene ENSG00000141510) (transcript ENST00000269305))
//! ```
//!
//! Properties follow the effective schema order and absent or empty values
//! are skipped, so identical records and schema yield identical bytes.

use super::{BucketContext, BucketKey, Format, FormatEncoder, bucket_file_name};
use crate::primitives::TYPE_DEFS_FILE;
use crate::schema::SchemaSet;
use crate::types::{PropertyValue, Record};
use std::io::{self, Write};

/// Encoder for the symbolic-atoms format.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomsEncoder;

impl FormatEncoder for AtomsEncoder {
    fn format(&self) -> Format {
        Format::Atoms
    }

    fn data_file(&self, key: &BucketKey) -> String {
        bucket_file_name(key, "metta")
    }

    fn open(&self, _ctx: &BucketContext<'_>, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn write(
        &self,
        ctx: &BucketContext<'_>,
        record: &Record,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let label = symbol(&ctx.key.label);
        let mut expr = match record {
            Record::Node(node) => format!("({} {}", label, symbol(&node.id)),
            Record::Edge(edge) => format!(
                "({} ({} {}) ({} {})",
                label,
                symbol(ctx.key.source_label.as_deref().unwrap_or_default()),
                symbol(&edge.source_id),
                symbol(ctx.key.target_label.as_deref().unwrap_or_default()),
                symbol(&edge.target_id),
            ),
        };
        let properties = record.properties();
        for column in ctx.columns {
            if let Some(value) = properties.get(column).and_then(render) {
                expr.push_str(&format!(" ({} {})", symbol(column), value));
            }
        }
        expr.push(')');
        writeln!(out, "{}", expr)
    }

    fn type_definitions(&self, schema: &SchemaSet) -> Option<(String, String)> {
        Some((TYPE_DEFS_FILE.to_string(), type_definitions(schema)))
    }
}

/// Escape a value into a single symbol: spaces become `_`, parentheses and
/// backslashes are escaped.
fn symbol(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        match c {
            ' ' | '\t' | '\n' | '\r' => out.push('_'),
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn render(value: &PropertyValue) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    Some(match value {
        PropertyValue::String(s) => symbol(s),
        PropertyValue::Integer(i) => i.to_string(),
        PropertyValue::Float(f) => f.to_string(),
        PropertyValue::StringList(items) => format!(
            "({})",
            items
                .iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| symbol(s))
                .collect::<Vec<_>>()
                .join(" ")
        ),
        PropertyValue::FloatList(items) => format!(
            "({})",
            items
                .iter()
                .map(f64::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        ),
    })
}

/// Type declarations, subtype relations and constructors for every type.
#[must_use]
pub fn type_definitions(schema: &SchemaSet) -> String {
    let mut decls = Vec::new();
    let mut subtypes = Vec::new();
    let mut constructors = Vec::new();
    for ty in schema.types() {
        let label = symbol(&ty.output_label);
        decls.push(format!("(: {} Type)", label));
        for parent in &ty.parents {
            if let Some(parent) = schema.lookup(parent) {
                subtypes.push(format!("(<: {} {})", label, symbol(&parent.output_label)));
            }
        }
        if ty.is_edge() {
            for source in &ty.source_types {
                for target in &ty.target_types {
                    let endpoint = |name: &str| {
                        schema
                            .lookup(name)
                            .map_or_else(|| symbol(name), |t| symbol(&t.output_label))
                    };
                    constructors.push(format!(
                        "(: {} (-> {} {} Type))",
                        label,
                        endpoint(source),
                        endpoint(target)
                    ));
                }
            }
        } else {
            constructors.push(format!("(: {} (-> $x Type))", label));
        }
    }
    let mut out = String::new();
    for line in decls.iter().chain(&subtypes).chain(&constructors) {
        out.push_str(line);
        out.push('\n');
    }
    out
}

// =============================================================================
// TESTS
// =============================================================================
