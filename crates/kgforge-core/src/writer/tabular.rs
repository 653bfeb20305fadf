//! # Tabular-Graph Format
//!
//! `|`-delimited bulk files with a companion Cypher load script per file.
//!
//! Load scripts are idempotent: node scripts declare a uniqueness constraint
//! on `id` and upsert with `MERGE`; edge scripts `MATCH` both endpoints by id
//! and `MERGE` the relationship on its edge key, so parallel edges of one
//! label stay distinct. Replaying a script only rewrites properties.

use super::{BucketContext, BucketKey, Format, FormatEncoder, bucket_file_name, edge_key};
use crate::primitives::{TABULAR_ARRAY_DELIMITER, TABULAR_DELIMITER};
use crate::types::{PropertyValue, Record, Representation, SemanticType};
use std::io::{self, Write};

/// Encoder for the tabular-graph format.
#[derive(Debug, Clone, Copy, Default)]
pub struct TabularEncoder;

/// Leading columns of edge files.
const EDGE_COLUMNS: [&str; 6] = [
    "id",
    "source_id",
    "target_id",
    "source_type",
    "target_type",
    "label",
];

impl FormatEncoder for TabularEncoder {
    fn format(&self) -> Format {
        Format::Tabular
    }

    fn data_file(&self, key: &BucketKey) -> String {
        bucket_file_name(key, "csv")
    }

    fn open(&self, ctx: &BucketContext<'_>, out: &mut dyn Write) -> io::Result<()> {
        let mut header: Vec<&str> = match ctx.key.representation {
            Representation::Node => vec!["id"],
            Representation::Edge => EDGE_COLUMNS.to_vec(),
        };
        header.extend(ctx.columns.iter().map(String::as_str));
        writeln!(out, "{}", header.join(&TABULAR_DELIMITER.to_string()))
    }

    fn write(
        &self,
        ctx: &BucketContext<'_>,
        record: &Record,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let mut fields: Vec<String> = match record {
            Record::Node(node) => vec![clean(&node.id)],
            Record::Edge(edge) => vec![
                clean(&edge_key(edge, &ctx.key.label)),
                clean(&edge.source_id),
                clean(&edge.target_id),
                clean(ctx.key.source_label.as_deref().unwrap_or_default()),
                clean(ctx.key.target_label.as_deref().unwrap_or_default()),
                clean(&ctx.key.label),
            ],
        };
        let properties = record.properties();
        fields.extend(
            ctx.columns
                .iter()
                .map(|c| properties.get(c).map(render).unwrap_or_default()),
        );
        writeln!(out, "{}", fields.join(&TABULAR_DELIMITER.to_string()))
    }

    fn close(&self, ctx: &BucketContext<'_>) -> Vec<(String, String)> {
        let name = bucket_file_name(ctx.key, "cypher");
        let script = match ctx.key.representation {
            Representation::Node => node_script(ctx),
            Representation::Edge => edge_script(ctx),
        };
        vec![(name, script)]
    }
}

/// Strip characters that would break a row or the loader's quoting.
fn clean(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '|' | '\'' | '"'))
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

fn render(value: &PropertyValue) -> String {
    let array = TABULAR_ARRAY_DELIMITER.to_string();
    match value {
        PropertyValue::String(s) => clean(s),
        PropertyValue::Integer(i) => i.to_string(),
        PropertyValue::Float(f) => f.to_string(),
        PropertyValue::StringList(items) => items
            .iter()
            .map(|s| clean(s).replace(TABULAR_ARRAY_DELIMITER, ","))
            .collect::<Vec<_>>()
            .join(&array),
        PropertyValue::FloatList(items) => items
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(&array),
    }
}

/// Cypher expression converting a CSV cell back to its declared type.
/// Empty cells become `null`, which removes the property on replay.
fn cell_expression(column: &str, semantic_type: SemanticType) -> String {
    let cell = format!("row.`{}`", column);
    match semantic_type {
        SemanticType::String => format!("CASE {cell} WHEN '' THEN null ELSE {cell} END"),
        SemanticType::Integer => format!("toInteger({cell})"),
        SemanticType::Float => format!("toFloat({cell})"),
        SemanticType::StringList => format!(
            "CASE {cell} WHEN '' THEN null ELSE split({cell}, '{}') END",
            TABULAR_ARRAY_DELIMITER
        ),
        SemanticType::FloatList => format!(
            "CASE {cell} WHEN '' THEN null ELSE [x IN split({cell}, '{}') | toFloat(x)] END",
            TABULAR_ARRAY_DELIMITER
        ),
    }
}

fn set_clause(ctx: &BucketContext<'_>, variable: &str) -> String {
    let assignments: Vec<String> = ctx
        .columns
        .iter()
        .map(|column| {
            let semantic_type = ctx
                .schema
                .property_type(column)
                .unwrap_or(SemanticType::String);
            format!(
                "{}.`{}` = {}",
                variable,
                column,
                cell_expression(column, semantic_type)
            )
        })
        .collect();
    if assignments.is_empty() {
        String::new()
    } else {
        format!(" SET {}", assignments.join(", "))
    }
}

fn load_rows(ctx: &BucketContext<'_>) -> String {
    format!(
        "LOAD CSV WITH HEADERS FROM 'file:///{}' AS row FIELDTERMINATOR '{}' RETURN row",
        ctx.load_path, TABULAR_DELIMITER
    )
}

fn node_script(ctx: &BucketContext<'_>) -> String {
    let label = &ctx.key.label;
    format!(
        "CREATE CONSTRAINT IF NOT EXISTS FOR (n:`{label}`) REQUIRE n.id IS UNIQUE;\n\
         CALL apoc.periodic.iterate(\n  \"{rows}\",\n  \"MERGE (n:`{label}` {{id: row.id}}){set}\",\n  \
         {{batchSize: {batch}, parallel: true, concurrency: 4}}\n) YIELD batches, total RETURN batches, total;\n",
        label = label,
        rows = load_rows(ctx),
        set = set_clause(ctx, "n"),
        batch = ctx.batch_size,
    )
}

fn edge_script(ctx: &BucketContext<'_>) -> String {
    let source = ctx.key.source_label.as_deref().unwrap_or_default();
    let target = ctx.key.target_label.as_deref().unwrap_or_default();
    format!(
        "CALL apoc.periodic.iterate(\n  \"{rows}\",\n  \
         \"MATCH (source:`{source}` {{id: row.source_id}}) \
         MATCH (target:`{target}` {{id: row.target_id}}) \
         MERGE (source)-[r:`{label}` {{id: row.id}}]->(target){set}\",\n  \
         {{batchSize: {batch}, parallel: false}}\n) YIELD batches, total RETURN batches, total;\n",
        rows = load_rows(ctx),
        source = source,
        target = target,
        label = ctx.key.label,
        set = set_clause(ctx, "r"),
        batch = ctx.batch_size,
    )
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
    name: str
    start: int
    synonyms: str[]
transcript:
  represented_as: node
regulates:
  represented_as: edge
  source: gene
  target: transcript
  properties:
    score: float
";

    fn node_ctx<'a>(schema: &'a SchemaSet, key: &'a BucketKey, columns: &'a [String]) -> BucketContext<'a> {
        BucketContext {
            key,
            schema: schema.resolve(&key.type_name).expect("type"),
            columns,
            batch_size: 1000,
            load_path: "gencode/nodes_gene.csv",
        }
    }

    fn gene_key() -> BucketKey {
        BucketKey {
            representation: Representation::Node,
            type_name: "gene".into(),
            label: "gene".into(),
            source_label: None,
            target_label: None,
        }
    }

    #[test]
    fn node_rows_follow_header_columns() {
        let schema = SchemaSet::load(DOC).expect("schema");
        let key = gene_key();
        let columns: Vec<String> = vec!["name".into(), "start".into(), "synonyms".into()];
        let ctx = node_ctx(&schema, &key, &columns);
        let record = Record::Node(
            NodeRecord::new("ENSG1", "gene")
                .with("name", "TP|53 \"x\"")
                .with("synonyms", vec!["a".to_string(), "b;c".to_string()]),
        );
        let mut out = Vec::new();
        TabularEncoder.open(&ctx, &mut out).expect("open");
        TabularEncoder.write(&ctx, &record, &mut out).expect("write");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "id|name|start|synonyms\nENSG1|TP53 x||a;b,c\n"
        );
    }

    #[test]
    fn parallel_edges_get_distinct_keys() {
        let schema = SchemaSet::load(DOC).expect("schema");
        let key = BucketKey {
            representation: Representation::Edge,
            type_name: "regulates".into(),
            label: "regulates".into(),
            source_label: Some("gene".into()),
            target_label: Some("transcript".into()),
        };
        let columns: Vec<String> = vec!["score".into()];
        let ctx = BucketContext {
            key: &key,
            schema: schema.resolve("regulates").expect("type"),
            columns: &columns,
            batch_size: 500,
            load_path: "edges_regulates_gene_transcript.csv",
        };
        let edge = EdgeRecord::new("regulates", ("gene", "G1"), ("transcript", "T1"));
        let mut out = Vec::new();
        for score in [0.25, 0.75] {
            let record = Record::Edge(edge.clone().with("score", PropertyValue::Float(score)));
            TabularEncoder.write(&ctx, &record, &mut out).expect("write");
        }
        let text = String::from_utf8(out).expect("utf8");
        let keys: Vec<&str> = text.lines().filter_map(|l| l.split('|').next()).collect();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn node_script_is_idempotent_upsert() {
        let schema = SchemaSet::load(DOC).expect("schema");
        let key = gene_key();
        let columns: Vec<String> = vec!["name".into(), "start".into()];
        let (name, script) = TabularEncoder
            .close(&node_ctx(&schema, &key, &columns))
            .pop()
            .expect("script");
        assert_eq!(name, "nodes_gene.cypher");
        assert!(script.starts_with(
            "CREATE CONSTRAINT IF NOT EXISTS FOR (n:`gene`) REQUIRE n.id IS UNIQUE;"
        ));
        assert!(script.contains("MERGE (n:`gene` {id: row.id})"));
        assert!(script.contains("n.`start` = toInteger(row.`start`)"));
        assert!(script.contains("file:///gencode/nodes_gene.csv"));
        assert!(!script.contains("CREATE (n"));
    }

    #[test]
    fn edge_rows_and_script_match_endpoints() {
        let schema = SchemaSet::load(DOC).expect("schema");
        let key = BucketKey {
            representation: Representation::Edge,
            type_name: "regulates".into(),
            label: "regulates".into(),
            source_label: Some("gene".into()),
            target_label: Some("transcript".into()),
        };
        let columns: Vec<String> = vec!["score".into()];
        let ctx = BucketContext {
            key: &key,
            schema: schema.resolve("regulates").expect("type"),
            columns: &columns,
            batch_size: 500,
            load_path: "edges_regulates_gene_transcript.csv",
        };
        let mut edge = EdgeRecord::new("regulates", ("gene", "G1"), ("transcript", "T1"))
            .with("score", PropertyValue::Float(0.25));
        edge.id = Some("R1".into());
        let mut out = Vec::new();
        TabularEncoder.open(&ctx, &mut out).expect("open");
        TabularEncoder
            .write(&ctx, &Record::Edge(edge), &mut out)
            .expect("write");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "id|source_id|target_id|source_type|target_type|label|score\n\
             R1|G1|T1|gene|transcript|regulates|0.25\n"
        );

        let (name, script) = TabularEncoder.close(&ctx).pop().expect("script");
        assert_eq!(name, "edges_regulates_gene_transcript.cypher");
        assert!(script.contains("MATCH (source:`gene` {id: row.source_id})"));
        assert!(script.contains("MERGE (source)-[r:`regulates` {id: row.id}]->(target)"));
        assert!(script.contains("batchSize: 500"));
    }
}
