//! # Graph Metadata
//!
//! Per-partition manifests and the whole-graph `graph_info.json` document.
//!
//! A full build aggregates every partition manifest. An incremental build
//! copies the prior version and adjusts its counts in place with
//! [`recompute_delta`]:
//!
//! ```text
//! new[t] = prior[t] - old_contribution[t] + new_contribution[t]
//! ```
//!
//! where contributions are summed over the changed partitions only. The same
//! rule applies to relationship triples; property sets are the union of every
//! partition's contribution.

use super::status::BuildMode;
use crate::primitives::{GRAPH_METADATA_FILE, PARTITION_MANIFEST_FILE};
use crate::source::SourceDescriptor;
use crate::types::{KgError, Provenance, Representation};
use crate::writer::{BucketKey, Format, Manifest, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

// =============================================================================
// PARTITION MANIFEST
// =============================================================================

/// What one source wrote into its partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub source: String,
    pub partition: String,
    pub fingerprint: String,
    #[serde(default)]
    pub provenance: Option<Provenance>,
    pub node_counts: BTreeMap<String, u64>,
    pub edge_counts: BTreeMap<String, u64>,
    pub rejected: u64,
    pub duplicates: u64,
    /// Property names observed per type.
    #[serde(default)]
    pub properties: BTreeMap<String, BTreeSet<String>>,
    /// Edge counts per `source|label|target` triple of output labels.
    #[serde(default)]
    pub relationships: BTreeMap<String, u64>,
    /// Files per format, relative to the partition directory.
    pub files: BTreeMap<Format, Vec<String>>,
    pub written_at: DateTime<Utc>,
}

impl PartitionManifest {
    /// Combine the writer manifests of one source.
    ///
    /// Every format sees the same records, so counts are taken from the first
    /// manifest; files are collected from all of them.
    #[must_use]
    pub fn from_manifests(descriptor: &SourceDescriptor, manifests: &[Manifest]) -> Self {
        let (node_counts, edge_counts, rejected, duplicates, properties, relationships) = manifests
            .first()
            .map(|m| {
                (
                    m.node_counts(),
                    m.edge_counts(),
                    m.rejected(),
                    m.types.values().map(|s| s.duplicates).sum::<u64>(),
                    m.properties.clone(),
                    relationship_counts(m),
                )
            })
            .unwrap_or_default();
        let files = manifests
            .iter()
            .map(|m| (m.format, m.files().map(str::to_string).collect()))
            .collect();
        Self {
            source: descriptor.name.clone(),
            partition: descriptor.partition.clone(),
            fingerprint: descriptor.fingerprint.clone(),
            provenance: descriptor.provenance.clone(),
            node_counts,
            edge_counts,
            rejected,
            duplicates,
            properties,
            relationships,
            files,
            written_at: Utc::now(),
        }
    }

    /// Manifest of the partition at `dir`, if one was written.
    pub fn load(dir: &Path) -> Result<Option<Self>, KgError> {
        let path = dir.join(PARTITION_MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|e| KgError::io(path.display(), e))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save(&self, dir: &Path) -> Result<(), KgError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&dir.join(PARTITION_MANIFEST_FILE), &bytes)
    }

    fn contribution(&self) -> PartitionContribution {
        PartitionContribution {
            source: self.source.clone(),
            fingerprint: self.fingerprint.clone(),
            provenance: self.provenance.clone(),
            node_counts: self.node_counts.clone(),
            edge_counts: self.edge_counts.clone(),
            properties: self.properties.clone(),
            relationships: self.relationships.clone(),
        }
    }
}

/// `source|label|target` key of an edge bucket.
fn relationship_key(key: &BucketKey) -> String {
    format!(
        "{}|{}|{}",
        key.source_label.as_deref().unwrap_or("any"),
        key.label,
        key.target_label.as_deref().unwrap_or("any")
    )
}

fn relationship_counts(manifest: &Manifest) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for bucket in manifest
        .buckets
        .iter()
        .filter(|b| b.key.representation == Representation::Edge && b.records > 0)
    {
        *counts.entry(relationship_key(&bucket.key)).or_insert(0) += bucket.records;
    }
    counts
}

// =============================================================================
// GRAPH METADATA
// =============================================================================

/// One partition's share of the graph, as recorded in `graph_info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionContribution {
    pub source: String,
    pub fingerprint: String,
    #[serde(default)]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub node_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub edge_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub properties: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub relationships: BTreeMap<String, u64>,
}

/// A type and how many records it has, for the ranked summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedCount {
    pub name: String,
    pub count: u64,
}

/// A delta that would have driven a count below zero.
///
/// The count is clamped to zero and the entry dropped; the flag stays in the
/// metadata for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeInconsistency {
    pub type_name: String,
    pub representation: Representation,
    pub prior: u64,
    pub removed: u64,
    pub added: u64,
    pub partitions: Vec<String>,
}

/// Contents of `graph_info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub version: String,
    pub build_mode: BuildMode,
    pub schema_fingerprint: String,
    /// Digest of the build settings that shaped the output files.
    #[serde(default)]
    pub settings_fingerprint: String,
    pub formats: Vec<Format>,
    pub node_count: u64,
    pub edge_count: u64,
    pub node_counts: BTreeMap<String, u64>,
    pub edge_counts: BTreeMap<String, u64>,
    /// Edge counts per `source|label|target` triple.
    #[serde(default)]
    pub relationships: BTreeMap<String, u64>,
    /// Property names observed per type, over every partition.
    #[serde(default)]
    pub properties: BTreeMap<String, BTreeSet<String>>,
    /// Node types, most frequent first.
    #[serde(default)]
    pub top_entities: Vec<RankedCount>,
    /// Edge types, most frequent first.
    #[serde(default)]
    pub top_connections: Vec<RankedCount>,
    pub partitions: BTreeMap<String, PartitionContribution>,
    #[serde(default)]
    pub datasets: Vec<Provenance>,
    #[serde(default)]
    pub merge_flags: Vec<MergeInconsistency>,
    pub generated_at: DateTime<Utc>,
}

impl GraphMetadata {
    /// Aggregate the manifests of a full build.
    #[must_use]
    pub fn aggregate(
        version: &str,
        schema_fingerprint: &str,
        settings_fingerprint: &str,
        formats: &[Format],
        manifests: &[PartitionManifest],
    ) -> Self {
        let mut node_counts = BTreeMap::new();
        let mut edge_counts = BTreeMap::new();
        let mut relationships = BTreeMap::new();
        let mut partitions = BTreeMap::new();
        for manifest in manifests {
            add_counts(&mut node_counts, &manifest.node_counts);
            add_counts(&mut edge_counts, &manifest.edge_counts);
            add_counts(&mut relationships, &manifest.relationships);
            partitions.insert(manifest.partition.clone(), manifest.contribution());
        }
        let mut metadata = Self {
            version: version.to_string(),
            build_mode: BuildMode::Full,
            schema_fingerprint: schema_fingerprint.to_string(),
            settings_fingerprint: settings_fingerprint.to_string(),
            formats: formats.to_vec(),
            node_count: 0,
            edge_count: 0,
            node_counts,
            edge_counts,
            relationships,
            properties: BTreeMap::new(),
            top_entities: Vec::new(),
            top_connections: Vec::new(),
            partitions,
            datasets: Vec::new(),
            merge_flags: Vec::new(),
            generated_at: Utc::now(),
        };
        metadata.refresh_totals();
        metadata
    }

    #[must_use]
    pub fn path(version_dir: &Path) -> std::path::PathBuf {
        version_dir.join(GRAPH_METADATA_FILE)
    }

    /// Read a metadata document from a file path.
    pub fn load(path: &Path) -> Result<Self, KgError> {
        let bytes = std::fs::read(path).map_err(|e| KgError::io(path.display(), e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, version_dir: &Path) -> Result<(), KgError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&Self::path(version_dir), &bytes)
    }

    fn refresh_totals(&mut self) {
        self.node_count = self.node_counts.values().sum();
        self.edge_count = self.edge_counts.values().sum();
        self.top_entities = ranked(&self.node_counts);
        self.top_connections = ranked(&self.edge_counts);
        self.properties = BTreeMap::new();
        for contribution in self.partitions.values() {
            for (type_name, names) in &contribution.properties {
                self.properties
                    .entry(type_name.clone())
                    .or_default()
                    .extend(names.iter().cloned());
            }
        }
        let mut seen = BTreeSet::new();
        self.datasets = self
            .partitions
            .values()
            .filter_map(|c| c.provenance.clone())
            .filter(|p| seen.insert(p.dataset.clone()))
            .collect();
    }
}

fn ranked(counts: &BTreeMap<String, u64>) -> Vec<RankedCount> {
    let mut ranked: Vec<RankedCount> = counts
        .iter()
        .map(|(name, count)| RankedCount {
            name: name.clone(),
            count: *count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    ranked
}

fn add_counts(into: &mut BTreeMap<String, u64>, from: &BTreeMap<String, u64>) {
    for (type_name, count) in from {
        *into.entry(type_name.clone()).or_insert(0) += count;
    }
}

// =============================================================================
// DELTA
// =============================================================================

/// Recompute counts for a version that replaced `changed_partitions` of
/// `prior`.
///
/// Each changed partition's old contribution comes from `prior`; its new
/// contribution from the manifest now in `new_version_dir`. A changed
/// partition without a manifest there was removed and contributes nothing.
/// Partitions not listed keep their prior contribution untouched.
pub fn recompute_delta(
    new_version_dir: &Path,
    prior: &GraphMetadata,
    changed_partitions: &[String],
) -> Result<GraphMetadata, KgError> {
    let changed: BTreeSet<&String> = changed_partitions.iter().collect();
    let mut partitions = prior.partitions.clone();
    let mut old_nodes = BTreeMap::new();
    let mut old_edges = BTreeMap::new();
    let mut old_relationships = BTreeMap::new();
    let mut new_nodes = BTreeMap::new();
    let mut new_edges = BTreeMap::new();
    let mut new_relationships = BTreeMap::new();

    for partition in &changed {
        if let Some(old) = partitions.remove(*partition) {
            add_counts(&mut old_nodes, &old.node_counts);
            add_counts(&mut old_edges, &old.edge_counts);
            add_counts(&mut old_relationships, &old.relationships);
        }
        if let Some(manifest) = PartitionManifest::load(&new_version_dir.join(partition))? {
            add_counts(&mut new_nodes, &manifest.node_counts);
            add_counts(&mut new_edges, &manifest.edge_counts);
            add_counts(&mut new_relationships, &manifest.relationships);
            partitions.insert((*partition).clone(), manifest.contribution());
        }
    }

    let partition_list: Vec<String> = changed.iter().map(|p| (*p).clone()).collect();
    let mut merge_flags = Vec::new();
    let node_counts = apply_delta(
        &prior.node_counts,
        &old_nodes,
        &new_nodes,
        Representation::Node,
        &partition_list,
        &mut merge_flags,
    );
    let edge_counts = apply_delta(
        &prior.edge_counts,
        &old_edges,
        &new_edges,
        Representation::Edge,
        &partition_list,
        &mut merge_flags,
    );
    let relationships = apply_delta(
        &prior.relationships,
        &old_relationships,
        &new_relationships,
        Representation::Edge,
        &partition_list,
        &mut merge_flags,
    );

    let version = new_version_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| prior.version.clone());
    let mut metadata = GraphMetadata {
        version,
        build_mode: BuildMode::Incremental,
        schema_fingerprint: prior.schema_fingerprint.clone(),
        settings_fingerprint: prior.settings_fingerprint.clone(),
        formats: prior.formats.clone(),
        node_count: 0,
        edge_count: 0,
        node_counts,
        edge_counts,
        relationships,
        properties: BTreeMap::new(),
        top_entities: Vec::new(),
        top_connections: Vec::new(),
        partitions,
        datasets: Vec::new(),
        merge_flags,
        generated_at: Utc::now(),
    };
    metadata.refresh_totals();
    Ok(metadata)
}

fn apply_delta(
    prior: &BTreeMap<String, u64>,
    removed: &BTreeMap<String, u64>,
    added: &BTreeMap<String, u64>,
    representation: Representation,
    partitions: &[String],
    flags: &mut Vec<MergeInconsistency>,
) -> BTreeMap<String, u64> {
    let names: BTreeSet<&String> = prior.keys().chain(removed.keys()).chain(added.keys()).collect();
    let mut counts = BTreeMap::new();
    for name in names {
        let before = prior.get(name).copied().unwrap_or(0);
        let minus = removed.get(name).copied().unwrap_or(0);
        let plus = added.get(name).copied().unwrap_or(0);
        let value = i128::from(before) - i128::from(minus) + i128::from(plus);
        if value < 0 {
            tracing::warn!(
                type_name = %name,
                %representation,
                prior = before,
                removed = minus,
                added = plus,
                "merge inconsistency: count clamped to zero"
            );
            flags.push(MergeInconsistency {
                type_name: name.clone(),
                representation,
                prior: before,
                removed: minus,
                added: plus,
                partitions: partitions.to_vec(),
            });
            continue;
        }
        if let Ok(count) = u64::try_from(value)
            && count > 0
        {
            counts.insert(name.clone(), count);
        }
    }
    counts
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(source: &str, nodes: &[(&str, u64)]) -> PartitionContribution {
        PartitionContribution {
            source: source.into(),
            fingerprint: "f".into(),
            provenance: None,
            node_counts: nodes.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
            edge_counts: BTreeMap::new(),
            properties: BTreeMap::from([(
                "gene".to_string(),
                BTreeSet::from([format!("{}_only", source)]),
            )]),
            relationships: BTreeMap::from([("gene|transcribed_to|transcript".to_string(), 1)]),
        }
    }

    fn prior(gene: u64, partitions: &[(&str, u64)]) -> GraphMetadata {
        GraphMetadata {
            version: "v1".into(),
            build_mode: BuildMode::Full,
            schema_fingerprint: "schema".into(),
            settings_fingerprint: "settings".into(),
            formats: vec![Format::Tabular],
            node_count: gene,
            edge_count: 0,
            node_counts: BTreeMap::from([("gene".to_string(), gene)]),
            edge_counts: BTreeMap::new(),
            relationships: BTreeMap::from([(
                "gene|transcribed_to|transcript".to_string(),
                partitions.len() as u64,
            )]),
            properties: BTreeMap::new(),
            top_entities: Vec::new(),
            top_connections: Vec::new(),
            partitions: partitions
                .iter()
                .map(|(p, n)| ((*p).to_string(), contribution(p, &[("gene", *n)])))
                .collect(),
            datasets: Vec::new(),
            merge_flags: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    fn write_manifest(dir: &Path, partition: &str, gene: u64) {
        let manifest = PartitionManifest {
            source: partition.into(),
            partition: partition.into(),
            fingerprint: "f2".into(),
            provenance: None,
            node_counts: BTreeMap::from([("gene".to_string(), gene)]),
            edge_counts: BTreeMap::new(),
            rejected: 0,
            duplicates: 0,
            properties: BTreeMap::from([(
                "gene".to_string(),
                BTreeSet::from(["chr".to_string()]),
            )]),
            relationships: BTreeMap::from([("gene|transcribed_to|transcript".to_string(), 3)]),
            files: BTreeMap::new(),
            written_at: Utc::now(),
        };
        manifest.save(&dir.join(partition)).expect("manifest");
    }

    #[test]
    fn delta_replaces_changed_contribution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let version_dir = dir.path().join("v2");
        write_manifest(&version_dir, "gencode", 14);
        let prior = prior(100, &[("gencode", 10), ("uniprot", 90)]);

        let merged = recompute_delta(&version_dir, &prior, &["gencode".to_string()]).expect("delta");
        assert_eq!(merged.node_counts["gene"], 104);
        assert_eq!(merged.node_count, 104);
        assert_eq!(merged.version, "v2");
        assert_eq!(merged.build_mode, BuildMode::Incremental);
        assert_eq!(merged.partitions["gencode"].node_counts["gene"], 14);
        assert_eq!(merged.partitions["gencode"].fingerprint, "f2");
        assert!(merged.merge_flags.is_empty());
    }

    #[test]
    fn removed_partition_subtracts_its_contribution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let version_dir = dir.path().join("v2");
        std::fs::create_dir_all(&version_dir).expect("dir");
        let prior = prior(100, &[("gencode", 10), ("uniprot", 90)]);

        let merged = recompute_delta(&version_dir, &prior, &["gencode".to_string()]).expect("delta");
        assert_eq!(merged.node_counts["gene"], 90);
        assert!(!merged.partitions.contains_key("gencode"));
    }

    #[test]
    fn negative_count_is_flagged_and_clamped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let version_dir = dir.path().join("v2");
        write_manifest(&version_dir, "gencode", 1);
        // Prior total disagrees with the recorded contribution.
        let prior = prior(5, &[("gencode", 10)]);

        let merged = recompute_delta(&version_dir, &prior, &["gencode".to_string()]).expect("delta");
        assert!(!merged.node_counts.contains_key("gene"));
        assert_eq!(merged.merge_flags.len(), 1);
        let flag = &merged.merge_flags[0];
        assert_eq!((flag.prior, flag.removed, flag.added), (5, 10, 1));
        assert_eq!(flag.partitions, ["gencode"]);
    }

    #[test]
    fn unchanged_partitions_are_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let version_dir = dir.path().join("v2");
        std::fs::create_dir_all(&version_dir).expect("dir");
        let prior = prior(100, &[("gencode", 10), ("uniprot", 90)]);
        let merged = recompute_delta(&version_dir, &prior, &[]).expect("delta");
        assert_eq!(merged.node_counts, prior.node_counts);
        assert_eq!(merged.partitions, prior.partitions);
    }

    #[test]
    fn aggregate_sums_partitions() {
        let descriptor = SourceDescriptor {
            name: "a".into(),
            partition: "a".into(),
            fingerprint: "f".into(),
            write_nodes: true,
            write_edges: true,
            provenance: Some(Provenance {
                dataset: "GENCODE".into(),
                url: String::new(),
                version: None,
            }),
        };
        let mut one = PartitionManifest::from_manifests(&descriptor, &[]);
        one.node_counts.insert("gene".into(), 3);
        let mut two = one.clone();
        two.partition = "b".into();
        two.edge_counts.insert("transcribed_to".into(), 2);

        let metadata = GraphMetadata::aggregate("v1", "fp", "settings", &Format::ALL, &[one, two]);
        assert_eq!(metadata.node_counts["gene"], 6);
        assert_eq!(metadata.node_count, 6);
        assert_eq!(metadata.edge_count, 2);
        assert_eq!(metadata.partitions.len(), 2);
        assert_eq!(metadata.datasets.len(), 1);
        assert_eq!(metadata.settings_fingerprint, "settings");
    }

    #[test]
    fn aggregate_collects_properties_and_relationships() {
        let descriptor = SourceDescriptor {
            name: "a".into(),
            partition: "a".into(),
            fingerprint: "f".into(),
            write_nodes: true,
            write_edges: true,
            provenance: None,
        };
        let mut one = PartitionManifest::from_manifests(&descriptor, &[]);
        one.node_counts.insert("gene".into(), 5);
        one.node_counts.insert("transcript".into(), 9);
        one.properties
            .insert("gene".into(), BTreeSet::from(["chr".to_string()]));
        one.relationships
            .insert("gene|transcribed_to|transcript".into(), 4);
        let mut two = one.clone();
        two.partition = "b".into();
        two.properties
            .insert("gene".into(), BTreeSet::from(["start".to_string()]));

        let metadata = GraphMetadata::aggregate("v1", "fp", "s", &[Format::Tabular], &[one, two]);
        assert_eq!(
            metadata.properties["gene"],
            BTreeSet::from(["chr".to_string(), "start".to_string()])
        );
        assert_eq!(metadata.relationships["gene|transcribed_to|transcript"], 8);
        assert_eq!(metadata.top_entities[0].name, "transcript");
        assert_eq!(metadata.top_entities[0].count, 18);
        assert_eq!(metadata.top_entities[1].name, "gene");
    }

    #[test]
    fn delta_recomputes_properties_and_relationships() {
        let dir = tempfile::tempdir().expect("tempdir");
        let version_dir = dir.path().join("v2");
        write_manifest(&version_dir, "gencode", 14);
        let prior = prior(100, &[("gencode", 10), ("uniprot", 90)]);

        let merged = recompute_delta(&version_dir, &prior, &["gencode".to_string()]).expect("delta");
        assert_eq!(merged.relationships["gene|transcribed_to|transcript"], 4);
        assert_eq!(
            merged.properties["gene"],
            BTreeSet::from(["chr".to_string(), "uniprot_only".to_string()])
        );
        assert_eq!(merged.top_entities[0].name, "gene");
        assert_eq!(merged.top_entities[0].count, 104);
    }
}
