//! # Configuration
//!
//! `kgforge.toml` describes one knowledge-graph project: build settings, the
//! record sources feeding it and the identifier mappings those sources use.
//!
//! ```toml
//! [build]
//! versions_root = "output"
//! schema = "schema.yaml"
//! formats = ["tabular", "atoms"]
//!
//! [[sources]]
//! name = "gencode"
//! nodes_file = "data/gencode_nodes.jsonl"
//! edges_file = "data/gencode_edges.jsonl"
//! dataset = "GENCODE"
//! url = "https://www.gencodegenes.org"
//! id_mapping = "hgnc"
//!
//! [[mappings]]
//! name = "hgnc"
//! url = "https://example.org/hgnc_complete_set.txt"
//! policy = "fixed_interval"
//! max_age_hours = 168
//! key_column = 1
//! value_column = 19
//! ```
//!
//! Relative paths resolve against the directory holding the file.

use crate::adapters::JsonLinesProvider;
use crate::remote::HttpMappingSource;
use kgforge_core::build::is_valid_partition;
use kgforge_core::{
    BuildMode, BuildRequest, BuildSettings, DelimitedTransform, FileMappingSource, FreshStatus, KgError, MappingCache,
    MappingSource, Provenance, RefreshPolicy, SourceDescriptor, SourceProvider,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "kgforge.toml";

/// Mapping caches live here when `cache_dir` is not set.
const DEFAULT_CACHE_SUBDIR: &str = ".mappings";

// =============================================================================
// DOCUMENT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub build: BuildSettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,
    /// Restrict builds to these sources. All sources when absent.
    #[serde(default)]
    pub include_sources: Option<Vec<String>>,
}

/// One JSON-lines record source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Output partition; defaults to the source name.
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub nodes_file: Option<PathBuf>,
    #[serde(default)]
    pub edges_file: Option<PathBuf>,
    #[serde(default = "enabled")]
    pub write_nodes: bool,
    #[serde(default = "enabled")]
    pub write_edges: bool,
    /// Dataset name stamped as `source` on every record.
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Translate node ids through this mapping; unmapped ids pass through.
    #[serde(default)]
    pub id_mapping: Option<String>,
    /// Normalise ids (`PREFIX:LOCAL` handling, upper-casing) before mapping.
    #[serde(default)]
    pub normalize_ids: bool,
    /// Keep curie prefixes when normalising.
    #[serde(default)]
    pub keep_prefix: bool,
}

/// One identifier mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(flatten)]
    pub policy: RefreshPolicy,
    #[serde(flatten)]
    pub transform: DelimitedTransform,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

const fn enabled() -> bool {
    true
}

// =============================================================================
// LOADING
// =============================================================================

impl Config {
    /// Load, resolve relative paths and validate.
    pub fn load(path: &Path) -> Result<Self, KgError> {
        let text = std::fs::read_to_string(path).map_err(|e| KgError::io(path.display(), e))?;
        let mut config = Self::parse(&text)?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// Parse a document without touching the filesystem.
    pub fn parse(text: &str) -> Result<Self, KgError> {
        toml::from_str(text).map_err(|e| KgError::InvalidConfig(e.to_string()))
    }

    /// Anchor every relative path at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        anchor(&mut self.build.versions_root);
        anchor(&mut self.build.schema);
        for source in &mut self.sources {
            source.nodes_file.iter_mut().for_each(anchor);
            source.edges_file.iter_mut().for_each(anchor);
        }
        for mapping in &mut self.mappings {
            mapping.path.iter_mut().for_each(anchor);
            mapping.cache_dir.iter_mut().for_each(anchor);
            if let RefreshPolicy::Dependency { artifact } = &mut mapping.policy {
                anchor(artifact);
            }
        }
    }

    pub fn validate(&self) -> Result<(), KgError> {
        self.build.validate()?;

        let mut names = BTreeSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(KgError::InvalidConfig(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
            if !is_valid_partition(source.partition()) {
                return Err(KgError::InvalidConfig(format!(
                    "source '{}': partition '{}' must match [A-Za-z0-9_-]+",
                    source.name,
                    source.partition()
                )));
            }
            if let Some(mapping) = &source.id_mapping {
                self.mapping_config(mapping)?;
            }
        }

        let mut mapping_names = BTreeSet::new();
        for mapping in &self.mappings {
            if !mapping_names.insert(mapping.name.as_str()) {
                return Err(KgError::InvalidConfig(format!(
                    "duplicate mapping name '{}'",
                    mapping.name
                )));
            }
            if mapping.url.is_some() == mapping.path.is_some() {
                return Err(KgError::InvalidConfig(format!(
                    "mapping '{}' needs exactly one of url or path",
                    mapping.name
                )));
            }
        }

        if let Some(include) = &self.include_sources {
            for name in include {
                if !names.contains(name.as_str()) {
                    return Err(KgError::InvalidConfig(format!(
                        "include_sources names unknown source '{}'",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Partitions of every configured source, selected or not.
    pub fn configured_partitions(&self) -> BTreeSet<String> {
        self.sources.iter().map(|s| s.partition().to_string()).collect()
    }

    /// Request for a build of the selected sources. Unselected sources keep
    /// their partitions from the prior version.
    pub fn build_request(&self, mode: BuildMode) -> BuildRequest {
        BuildRequest::new(mode).with_configured_partitions(self.configured_partitions())
    }

    /// Sources selected for building, in configuration order.
    pub fn selected_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| {
            self.include_sources
                .as_ref()
                .is_none_or(|include| include.iter().any(|n| n == &s.name))
        })
    }

    // =========================================================================
    // MAPPINGS
    // =========================================================================

    pub fn mapping_config(&self, name: &str) -> Result<&MappingConfig, KgError> {
        self.mappings
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| KgError::InvalidConfig(format!("unknown mapping '{}'", name)))
    }

    /// Open the named mapping's cache. Nothing is fetched.
    pub fn open_mapping(&self, name: &str) -> Result<MappingCache, KgError> {
        let mapping = self.mapping_config(name)?;
        let source: Arc<dyn MappingSource> = match (&mapping.url, &mapping.path) {
            (Some(url), _) => Arc::new(HttpMappingSource::new(
                &mapping.name,
                url,
                mapping.transform.clone(),
            )?),
            (None, Some(path)) => Arc::new(FileMappingSource::new(
                &mapping.name,
                path,
                mapping.transform.clone(),
            )),
            (None, None) => {
                return Err(KgError::InvalidConfig(format!(
                    "mapping '{}' has no url or path",
                    name
                )));
            }
        };
        let cache_dir = mapping
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.build.versions_root.join(DEFAULT_CACHE_SUBDIR));
        std::fs::create_dir_all(&cache_dir).map_err(|e| KgError::io(cache_dir.display(), e))?;
        Ok(MappingCache::open(&mapping.name, &cache_dir, source)?)
    }

    // =========================================================================
    // PROVIDERS
    // =========================================================================

    /// Build a provider for every selected source.
    ///
    /// Mappings named by sources are brought up to date under their policy
    /// first, each at most once. Their table fingerprints feed the source
    /// fingerprints, so a refreshed mapping marks dependent sources dirty.
    pub fn providers(&self) -> Result<Vec<Arc<dyn SourceProvider>>, KgError> {
        let mut caches: Vec<Arc<MappingCache>> = Vec::new();
        let mut providers: Vec<Arc<dyn SourceProvider>> = Vec::new();

        for source in self.selected_sources() {
            let mapping = match &source.id_mapping {
                Some(name) => {
                    let opened = caches.iter().find(|c| c.name() == name.as_str()).cloned();
                    Some(match opened {
                        Some(cache) => cache,
                        None => {
                            let cache = Arc::new(self.open_mapping(name)?);
                            let status = cache.ensure_fresh(&self.mapping_config(name)?.policy)?;
                            if status == FreshStatus::StaleFallback {
                                tracing::warn!(mapping = %name, "building with a stale mapping table");
                            }
                            caches.push(Arc::clone(&cache));
                            cache
                        }
                    })
                }
                None => None,
            };
            let descriptor = source.descriptor(mapping.as_deref())?;
            providers.push(Arc::new(JsonLinesProvider::new(
                descriptor,
                source.clone(),
                mapping,
            )));
        }
        Ok(providers)
    }
}

impl SourceConfig {
    #[must_use]
    pub fn partition(&self) -> &str {
        self.partition.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn provenance(&self) -> Option<Provenance> {
        self.dataset.as_ref().map(|dataset| Provenance {
            dataset: dataset.clone(),
            url: self.url.clone().unwrap_or_default(),
            version: self.version.clone(),
        })
    }

    /// Descriptor whose fingerprint covers this configuration, the size and
    /// modification time of each input file and the mapping table in use.
    pub fn descriptor(&self, mapping: Option<&MappingCache>) -> Result<SourceDescriptor, KgError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&serde_json::to_vec(self)?);
        for file in self.nodes_file.iter().chain(self.edges_file.iter()) {
            let metadata = std::fs::metadata(file).map_err(|e| KgError::io(file.display(), e))?;
            hasher.update(&metadata.len().to_le_bytes());
            if let Ok(modified) = metadata.modified() {
                let stamp = mtime_stamp(modified);
                hasher.update(stamp.as_bytes());
            }
        }
        if let Some(version) = mapping.and_then(MappingCache::version) {
            hasher.update(version.fingerprint.as_bytes());
        }

        Ok(SourceDescriptor {
            name: self.name.clone(),
            partition: self.partition().to_string(),
            fingerprint: hasher.finalize().to_hex().to_string(),
            write_nodes: self.write_nodes,
            write_edges: self.write_edges,
            provenance: self.provenance(),
        })
    }
}

fn mtime_stamp(time: std::time::SystemTime) -> String {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => format!("{}.{:09}", d.as_secs(), d.subsec_nanos()),
        Err(_) => String::new(),
    }
}

// =============================================================================
// TESTS
// =============================================================================
