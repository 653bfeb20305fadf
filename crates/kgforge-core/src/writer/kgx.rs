//! # KGX JSON-Lines Format
//!
//! One JSON object per record, in the KGX exchange layout:
//!
//! ```text
//! {"id":"ENSG00000141510","category":["gene"],"chr":"chr17"}
//! {"id":"ENSG00000141510_transcribed_to_ENST00000269305","subject":"ENSG00000141510","predicate":"transcribed_to","object":"ENST00000269305","source_type":"gene","target_type":"transcript"}
//! ```
//!
//! Reserved keys come first and are never overwritten by a property of the
//! same name. Properties follow the effective schema order; empty values are
//! left out.

use super::{BucketContext, BucketKey, Format, FormatEncoder, bucket_file_name, edge_key};
use crate::types::Record;
use serde_json::{Map, Value};
use std::io::{self, Write};

/// Encoder for KGX JSON lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct KgxEncoder;

impl FormatEncoder for KgxEncoder {
    fn format(&self) -> Format {
        Format::Kgx
    }

    fn data_file(&self, key: &BucketKey) -> String {
        bucket_file_name(key, "jsonl")
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
        let label = ctx.key.label.as_str();
        let mut object = Map::new();
        match record {
            Record::Node(node) => {
                object.insert("id".into(), node.id.clone().into());
                object.insert("category".into(), Value::Array(vec![label.into()]));
            }
            Record::Edge(edge) => {
                object.insert("id".into(), edge_key(edge, label).into());
                object.insert("subject".into(), edge.source_id.clone().into());
                object.insert("predicate".into(), label.into());
                object.insert("object".into(), edge.target_id.clone().into());
                let endpoint = |l: Option<&String>| l.map_or(Value::Null, |l| l.as_str().into());
                object.insert("source_type".into(), endpoint(ctx.key.source_label.as_ref()));
                object.insert("target_type".into(), endpoint(ctx.key.target_label.as_ref()));
            }
        }

        let properties = record.properties();
        for column in ctx.columns {
            let Some(value) = properties.get(column).filter(|v| !v.is_empty()) else {
                continue;
            };
            if !object.contains_key(column) {
                let encoded = serde_json::to_value(value).map_err(io::Error::other)?;
                object.insert(column.clone(), encoded);
            }
        }
        serde_json::to_writer(&mut *out, &Value::Object(object)).map_err(io::Error::other)?;
        writeln!(out)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaSet;
    use crate::types::{EdgeRecord, NodeRecord, PropertyValue, Representation};

    const DOC: &str = "
gene:
  represented_as: node
  properties:
    chr: str
    synonyms: str[]
transcript:
  represented_as: node
transcribed to:
  represented_as: edge
  input_label: transcribed_to
  source: gene
  target: transcript
  properties:
    score: float
";

    fn key(representation: Representation, type_name: &str) -> BucketKey {
        let edge = representation == Representation::Edge;
        BucketKey {
            representation,
            type_name: type_name.into(),
            label: type_name.replace(' ', "_"),
            source_label: edge.then(|| "gene".to_string()),
            target_label: edge.then(|| "transcript".to_string()),
        }
    }

    fn encode(schema: &SchemaSet, key: &BucketKey, columns: &[String], record: Record) -> Value {
        let ctx = BucketContext {
            key,
            schema: schema.resolve(&key.type_name).expect("type"),
            columns,
            batch_size: 10,
            load_path: "",
        };
        let mut out = Vec::new();
        KgxEncoder.write(&ctx, &record, &mut out).expect("write");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text.lines().count(), 1);
        serde_json::from_str(&text).expect("json")
    }

    #[test]
    fn node_lines_carry_category_and_properties() {
        let schema = SchemaSet::load(DOC).expect("schema");
        let key = key(Representation::Node, "gene");
        let columns: Vec<String> = vec!["chr".into(), "id".into(), "synonyms".into()];
        let node = NodeRecord::new("ENSG1", "gene")
            .with("chr", "chr17")
            .with("id", "shadow")
            .with("synonyms", Vec::<String>::new());
        let value = encode(&schema, &key, &columns, Record::Node(node));
        assert_eq!(value["id"], "ENSG1");
        assert_eq!(value["category"], serde_json::json!(["gene"]));
        assert_eq!(value["chr"], "chr17");
        assert!(value.get("synonyms").is_none());
    }

    #[test]
    fn edge_lines_name_subject_predicate_object() {
        let schema = SchemaSet::load(DOC).expect("schema");
        let key = key(Representation::Edge, "transcribed to");
        let columns: Vec<String> = vec!["score".into()];
        let edge = EdgeRecord::new("transcribed_to", ("gene", "G1"), ("transcript", "T1"))
            .with("score", PropertyValue::Float(0.5));
        let expected_id = edge_key(&edge, "transcribed_to");
        let value = encode(&schema, &key, &columns, Record::Edge(edge));
        assert_eq!(value["id"], expected_id.as_str());
        assert_eq!(value["subject"], "G1");
        assert_eq!(value["predicate"], "transcribed_to");
        assert_eq!(value["object"], "T1");
        assert_eq!(value["source_type"], "gene");
        assert_eq!(value["score"], 0.5);
    }
}
