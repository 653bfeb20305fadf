//! # Logic-Facts Format
//!
//! One fact per record. Argument positions follow the effective schema:
//!
//! ```text
//! % gene(id, chr, start)
//! gene('ENSG00000141510', chr17, 7661779).
//! % transcribed_to(source, target)
//! transcribed_to(gene('ENSG00000141510'), transcript('ENST00000269305')).
//! ```
//!
//! Absent properties are written as `null` so every fact of a predicate has
//! the same arity.

use super::{BucketContext, BucketKey, Format, FormatEncoder, bucket_file_name};
use crate::types::{PropertyValue, Record, Representation};
use std::io::{self, Write};

/// Encoder for the logic-facts format.
#[derive(Debug, Clone, Copy, Default)]
pub struct FactsEncoder;

impl FormatEncoder for FactsEncoder {
    fn format(&self) -> Format {
        Format::Facts
    }

    fn data_file(&self, key: &BucketKey) -> String {
        bucket_file_name(key, "pl")
    }

    fn open(&self, ctx: &BucketContext<'_>, out: &mut dyn Write) -> io::Result<()> {
        let mut args: Vec<&str> = match ctx.key.representation {
            Representation::Node => vec!["id"],
            Representation::Edge => vec!["source", "target"],
        };
        args.extend(ctx.columns.iter().map(String::as_str));
        writeln!(out, "% {}({})", functor(&ctx.key.label), args.join(", "))
    }

    fn write(
        &self,
        ctx: &BucketContext<'_>,
        record: &Record,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let mut args = match record {
            Record::Node(node) => vec![atom(&node.id)],
            Record::Edge(edge) => vec![
                format!(
                    "{}({})",
                    functor(ctx.key.source_label.as_deref().unwrap_or_default()),
                    atom(&edge.source_id)
                ),
                format!(
                    "{}({})",
                    functor(ctx.key.target_label.as_deref().unwrap_or_default()),
                    atom(&edge.target_id)
                ),
            ],
        };
        let properties = record.properties();
        args.extend(
            ctx.columns
                .iter()
                .map(|c| properties.get(c).map_or_else(|| "null".to_string(), term)),
        );
        writeln!(out, "{}({}).", functor(&ctx.key.label), args.join(", "))
    }
}

/// Predicate name: lower-case, separators folded to `_`, other punctuation
/// dropped.
fn functor(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.trim().chars() {
        match c {
            ' ' | '-' | ':' | '/' | '\u{2013}' | '\u{2014}' | '&' => out.push('_'),
            c if c.is_alphanumeric() || c == '_' => out.extend(c.to_lowercase()),
            _ => {}
        }
    }
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    let out = out.trim_matches('_').to_string();
    match out.chars().next() {
        Some(c) if c.is_ascii_lowercase() => out,
        Some(_) => format!("t_{}", out),
        None => "unknown".to_string(),
    }
}

/// An atom, bare when it is already a valid unquoted atom, quoted otherwise.
fn atom(value: &str) -> String {
    let bare = value.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if bare {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

fn number(f: f64) -> String {
    if f.is_finite() {
        format!("{:?}", f)
    } else {
        atom(&f.to_string())
    }
}

fn term(value: &PropertyValue) -> String {
    match value {
        PropertyValue::String(s) => atom(s),
        PropertyValue::Integer(i) => i.to_string(),
        PropertyValue::Float(f) => number(*f),
        PropertyValue::StringList(items) => format!(
            "[{}]",
            items.iter().map(|s| atom(s)).collect::<Vec<_>>().join(", ")
        ),
        PropertyValue::FloatList(items) => format!(
            "[{}]",
            items
                .iter()
                .map(|f| number(*f))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaSet;
    use crate::types::{EdgeRecord, NodeRecord};

    const DOC: &str = "
gene:
  represented_as: node
  properties:
    chr: str
    start: int
    score: float
    aliases: str[]
transcript:
  represented_as: node
transcribed to:
  represented_as: edge
  source: gene
  target: transcript
";

    fn gene_ctx<'a>(schema: &'a SchemaSet, key: &'a BucketKey, columns: &'a [String]) -> BucketContext<'a> {
        BucketContext {
            key,
            schema: schema.resolve("gene").expect("gene"),
            columns,
            batch_size: 10,
            load_path: "",
        }
    }

    #[test]
    fn node_fact_keeps_schema_arity() {
        let schema = SchemaSet::load(DOC).expect("schema");
        let key = BucketKey {
            representation: Representation::Node,
            type_name: "gene".into(),
            label: "gene".into(),
            source_label: None,
            target_label: None,
        };
        let columns: Vec<String> = vec![
            "chr".into(),
            "start".into(),
            "score".into(),
            "aliases".into(),
        ];
        let ctx = gene_ctx(&schema, &key, &columns);
        let record = Record::Node(
            NodeRecord::new("ENSG1", "gene")
                .with("chr", "chr17")
                .with("score", PropertyValue::Float(1.0))
                .with("aliases", vec!["p53".to_string(), "O'Brien".to_string()]),
        );
        let mut out = Vec::new();
        FactsEncoder.open(&ctx, &mut out).expect("open");
        FactsEncoder.write(&ctx, &record, &mut out).expect("write");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "% gene(id, chr, start, score, aliases)\n\
             gene('ENSG1', chr17, null, 1.0, [p53, 'O\\'Brien']).\n"
        );
    }

    #[test]
    fn edge_fact_wraps_endpoints() {
        let schema = SchemaSet::load(DOC).expect("schema");
        let key = BucketKey {
            representation: Representation::Edge,
            type_name: "transcribed to".into(),
            label: "transcribed to".into(),
            source_label: Some("gene".into()),
            target_label: Some("transcript".into()),
        };
        let ctx = BucketContext {
            key: &key,
            schema: schema.resolve("transcribed to").expect("edge"),
            columns: &[],
            batch_size: 10,
            load_path: "",
        };
        let record = Record::Edge(EdgeRecord::new(
            "transcribed to",
            ("gene", "ENSG1"),
            ("transcript", "enst1"),
        ));
        let mut out = Vec::new();
        FactsEncoder.write(&ctx, &record, &mut out).expect("write");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "transcribed_to(gene('ENSG1'), transcript(enst1)).\n"
        );
    }

    #[test]
    fn functor_normalises_labels() {
        assert_eq!(functor("Gene Ontology: term"), "gene_ontology_term");
        assert_eq!(functor("5' UTR"), "t_5_utr");
        assert_eq!(functor("a\u{2013}b & c"), "a_b_c");
    }
}
