//! # Build Version Controller
//!
//! Turns configured sources into an immutable version directory:
//!
//! ```text
//! <versions_root>/
//!   latest -> v20261019T081500123Z
//!   v20261019T081500123Z/
//!     build_status.json
//!     graph_info.json
//!     type_defs.metta
//!     <partition>/
//!       .partition_manifest.json
//!       nodes_gene.csv  nodes_gene.cypher  nodes_gene.metta  nodes_gene.pl  nodes_gene.jsonl ...
//! ```
//!
//! Each source owns one partition. Sources fan out over a bounded `rayon`
//! pool; the metadata document is written once, after every source joined.
//!
//! An incremental build re-runs only the sources whose configuration changed,
//! writes them into a `.partial/` scratch area, copies the rest from the prior
//! version and swaps the changed partitions in. A changed schema or a change
//! to the settings that shape output files forces a full build. `latest`
//! moves only once a version reached `completed`.
//!
//! A request may run a subset of the configured sources. Configured partitions
//! that are not selected are carried over from the prior version untouched;
//! only partitions dropped from the configuration are removed.

pub mod metadata;
pub mod status;
pub mod versions;

pub use metadata::{
    GraphMetadata, MergeInconsistency, PartitionContribution, PartitionManifest, RankedCount,
    recompute_delta,
};
pub use status::{BuildMode, BuildState, BuildStatus, Liveness};
pub use versions::{VersionEntry, VersionStore};

use crate::primitives::{
    BUILD_STATUS_FILE, DEFAULT_BATCH_SIZE, DEFAULT_PARALLELISM, DEFAULT_RETENTION,
    GRAPH_METADATA_FILE, PARTIAL_OUTPUT_DIR,
};
use crate::schema::SchemaSet;
use crate::source::SourceProvider;
use crate::types::{CancelToken, KgError, Record};
use crate::writer::{
    DuplicatePolicy, Format, IdRegistry, WriterOptions, WriterSession, write_atomic,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use walkdir::WalkDir;

// =============================================================================
// SETTINGS
// =============================================================================

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    pub versions_root: PathBuf,
    /// Schema document (YAML).
    pub schema: PathBuf,
    #[serde(default = "default_formats")]
    pub formats: Vec<Format>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Completed versions kept by pruning.
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Stamp records with their source's dataset provenance.
    #[serde(default = "enabled")]
    pub provenance: bool,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    /// Sources processed concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_formats() -> Vec<Format> {
    Format::ALL.to_vec()
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_retention() -> usize {
    DEFAULT_RETENTION
}

const fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

const fn enabled() -> bool {
    true
}

impl BuildSettings {
    #[must_use]
    pub fn new(versions_root: impl Into<PathBuf>, schema: impl Into<PathBuf>) -> Self {
        Self {
            versions_root: versions_root.into(),
            schema: schema.into(),
            formats: default_formats(),
            batch_size: DEFAULT_BATCH_SIZE,
            retention: DEFAULT_RETENTION,
            provenance: true,
            duplicate_policy: DuplicatePolicy::default(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn validate(&self) -> Result<(), KgError> {
        if self.formats.is_empty() {
            return Err(KgError::InvalidConfig("no output formats configured".into()));
        }
        let unique: BTreeSet<&Format> = self.formats.iter().collect();
        if unique.len() != self.formats.len() {
            return Err(KgError::InvalidConfig("output format listed twice".into()));
        }
        if self.parallelism == 0 {
            return Err(KgError::InvalidConfig("parallelism must be at least 1".into()));
        }
        if self.retention == 0 {
            return Err(KgError::InvalidConfig("retention must be at least 1".into()));
        }
        self.writer_options(Format::Tabular, "").map(|_| ())
    }

    /// Digest of the settings that shape written files.
    ///
    /// Parallelism and retention are left out; format order does not matter.
    #[must_use]
    pub fn output_fingerprint(&self) -> String {
        let formats: BTreeSet<&Format> = self.formats.iter().collect();
        let mut hasher = blake3::Hasher::new();
        for format in formats {
            hasher.update(format.as_str().as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(&(self.batch_size as u64).to_le_bytes());
        hasher.update(&[u8::from(self.provenance)]);
        hasher.update(self.duplicate_policy.as_str().as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn writer_options(&self, format: Format, partition: &str) -> Result<WriterOptions, KgError> {
        let options = WriterOptions {
            format,
            batch_size: self.batch_size,
            provenance: None,
            duplicate_policy: self.duplicate_policy,
            load_prefix: partition.to_string(),
        };
        options.validate()?;
        Ok(options)
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Parameters of one build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Version id; generated when absent.
    pub version: Option<String>,
    pub mode: BuildMode,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub log_file: Option<PathBuf>,
    /// Every partition the configuration declares. When set, the providers
    /// handed to the build may be a subset of it; `None` means they are the
    /// whole configuration.
    pub configured_partitions: Option<BTreeSet<String>>,
}

impl BuildRequest {
    #[must_use]
    pub fn new(mode: BuildMode) -> Self {
        Self {
            version: None,
            mode,
            commit: None,
            branch: None,
            log_file: None,
            configured_partitions: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_configured_partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configured_partitions = Some(partitions.into_iter().map(Into::into).collect());
        self
    }
}

/// Result of [`BuildController::request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The version is queued and may be run.
    Queued(BuildStatus),
    /// A build of this version is already running; nothing was changed.
    AlreadyRunning(BuildStatus),
}

impl RequestOutcome {
    #[must_use]
    pub fn status(&self) -> &BuildStatus {
        match self {
            Self::Queued(s) | Self::AlreadyRunning(s) => s,
        }
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Orchestrates versioned builds under one versions root.
#[derive(Debug)]
pub struct BuildController {
    settings: BuildSettings,
    store: VersionStore,
    active: Mutex<BTreeSet<String>>,
}

/// Marks a version as running in this process until dropped.
struct ActiveGuard<'a> {
    active: &'a Mutex<BTreeSet<String>>,
    version: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.version);
    }
}

impl BuildController {
    pub fn new(settings: BuildSettings) -> Result<Self, KgError> {
        settings.validate()?;
        fs::create_dir_all(&settings.versions_root)
            .map_err(|e| KgError::io(settings.versions_root.display(), e))?;
        Ok(Self {
            store: VersionStore::new(&settings.versions_root),
            settings,
            active: Mutex::new(BTreeSet::new()),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    #[must_use]
    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// Status of `version`, or of the `latest` version when `None`.
    pub fn status(&self, version: Option<&str>) -> Result<Option<BuildStatus>, KgError> {
        let id = match version {
            Some(v) => v.to_string(),
            None => match self.store.latest() {
                Some(v) => v,
                None => return Ok(None),
            },
        };
        VersionStore::validate_id(&id)?;
        BuildStatus::load(&self.store.version_dir(&id))
    }

    fn is_active(&self, version: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(version)
    }

    fn claim(&self, version: &str) -> Option<ActiveGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.insert(version.to_string()).then(|| ActiveGuard {
            active: &self.active,
            version: version.to_string(),
        })
    }

    /// Create a `queued` version.
    ///
    /// A request for a version that is already running is a no-op returning
    /// its current status. Failed, cancelled and orphaned versions are reset
    /// and queued again. Completed versions are immutable.
    pub fn request(&self, request: &BuildRequest) -> Result<RequestOutcome, KgError> {
        let id = request
            .version
            .clone()
            .unwrap_or_else(VersionStore::new_version_id);
        VersionStore::validate_id(&id)?;
        let dir = self.store.version_dir(&id);

        if let Some(existing) = BuildStatus::load(&dir)? {
            if self.is_active(&id) {
                return Ok(RequestOutcome::AlreadyRunning(existing));
            }
            match existing.status {
                BuildState::Queued => return Ok(RequestOutcome::Queued(existing)),
                BuildState::Completed => {
                    return Err(KgError::BuildError(format!(
                        "version {} is already completed",
                        id
                    )));
                }
                BuildState::Running => match existing.liveness() {
                    Liveness::Live | Liveness::Unknown if existing.pid != std::process::id() => {
                        return Ok(RequestOutcome::AlreadyRunning(existing));
                    }
                    _ => tracing::warn!(version = %id, pid = existing.pid, "resetting orphaned build"),
                },
                BuildState::Failed | BuildState::Cancelled => {
                    tracing::info!(version = %id, status = %existing.status, "retrying version");
                }
            }
            fs::remove_dir_all(&dir).map_err(|e| KgError::io(dir.display(), e))?;
        }

        fs::create_dir_all(&dir).map_err(|e| KgError::io(dir.display(), e))?;
        let mut status = BuildStatus::queued(&id, request.mode);
        status.commit.clone_from(&request.commit);
        status.branch.clone_from(&request.branch);
        status.log_file.clone_from(&request.log_file);
        status.save(&dir)?;
        tracing::info!(version = %id, mode = %request.mode, "build queued");
        Ok(RequestOutcome::Queued(status))
    }

    /// Request and run in one call.
    pub fn build(
        &self,
        request: &BuildRequest,
        sources: &[Arc<dyn SourceProvider>],
        cancel: &CancelToken,
    ) -> Result<BuildStatus, KgError> {
        match self.request(request)? {
            RequestOutcome::AlreadyRunning(status) => Ok(status),
            RequestOutcome::Queued(status) => self.run_selected(
                &status.version,
                sources,
                request.configured_partitions.as_ref(),
                cancel,
            ),
        }
    }

    /// Run a queued version to a terminal state.
    ///
    /// Source, schema and I/O failures end the version as `failed` and are
    /// reported through the returned status; `Err` means the status document
    /// itself could not be maintained or `latest` could not be advanced.
    pub fn run(
        &self,
        version: &str,
        sources: &[Arc<dyn SourceProvider>],
        cancel: &CancelToken,
    ) -> Result<BuildStatus, KgError> {
        self.run_selected(version, sources, None, cancel)
    }

    /// [`Self::run`] with `sources` selected out of `configured` partitions.
    pub fn run_selected(
        &self,
        version: &str,
        sources: &[Arc<dyn SourceProvider>],
        configured: Option<&BTreeSet<String>>,
        cancel: &CancelToken,
    ) -> Result<BuildStatus, KgError> {
        VersionStore::validate_id(version)?;
        let dir = self.store.version_dir(version);
        let Some(mut status) = BuildStatus::load(&dir)? else {
            return Err(KgError::BuildError(format!(
                "version {} was never requested",
                version
            )));
        };
        let Some(_guard) = self.claim(version) else {
            return Ok(status);
        };
        if status.status != BuildState::Queued {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            status.transition(BuildState::Cancelled, "cancelled before start")?;
            status.save(&dir)?;
            return Ok(status);
        }

        status.transition(BuildState::Running, "build running")?;
        status.save(&dir)?;
        tracing::info!(version, mode = %status.requested_mode, sources = sources.len(), "build started");

        match self.execute(&dir, &mut status, sources, configured, cancel) {
            Ok(message) => {
                status.transition(BuildState::Completed, message)?;
                status.save(&dir)?;
                self.store.set_latest(version)?;
                tracing::info!(version, mode = %status.build_mode, "build completed");
                match self.store.prune(self.settings.retention) {
                    Ok(removed) if !removed.is_empty() => {
                        tracing::info!(removed = removed.len(), "retention applied");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "pruning old versions failed"),
                }
            }
            Err(KgError::Cancelled) => {
                discard_scratch(&dir);
                status.transition(BuildState::Cancelled, "build cancelled")?;
                status.save(&dir)?;
                tracing::warn!(version, "build cancelled");
            }
            Err(e) => {
                discard_scratch(&dir);
                status.transition(BuildState::Failed, e.to_string())?;
                status.save(&dir)?;
                tracing::error!(version, error = %e, "build failed");
            }
        }
        Ok(status)
    }

    fn execute(
        &self,
        dir: &Path,
        status: &mut BuildStatus,
        sources: &[Arc<dyn SourceProvider>],
        configured: Option<&BTreeSet<String>>,
        cancel: &CancelToken,
    ) -> Result<String, KgError> {
        let schema = Arc::new(SchemaSet::load_path(&self.settings.schema)?);
        check_partitions(sources, configured)?;
        cancel.check()?;

        let baseline = match status.requested_mode {
            BuildMode::Full => None,
            BuildMode::Incremental => self.incremental_baseline(&schema, status),
        };
        status.save(dir)?;

        match baseline {
            None => self.full_build(dir, &status.version, &schema, sources, cancel),
            Some((prior_id, prior)) => self.incremental_build(
                dir,
                &schema,
                sources,
                configured,
                &prior_id,
                &prior,
                cancel,
            ),
        }
    }

    /// Prior version to merge against, or `None` to fall back to a full build.
    fn incremental_baseline(
        &self,
        schema: &SchemaSet,
        status: &mut BuildStatus,
    ) -> Option<(String, GraphMetadata)> {
        status.build_mode = BuildMode::Full;
        let Some(prior_id) = self.store.latest() else {
            status.message = "no prior version; running full build".into();
            tracing::info!(version = %status.version, "no prior version; running full build");
            return None;
        };
        let path = GraphMetadata::path(&self.store.version_dir(&prior_id));
        let prior = match GraphMetadata::load(&path) {
            Ok(prior) => prior,
            Err(e) => {
                status.message = format!("prior version {} unreadable; running full build", prior_id);
                tracing::warn!(prior = %prior_id, error = %e, "prior metadata unreadable; running full build");
                return None;
            }
        };
        if prior.schema_fingerprint != schema.fingerprint() {
            status.message = format!("schema changed since {}; running full build", prior_id);
            tracing::info!(prior = %prior_id, "schema changed; running full build");
            return None;
        }
        if prior.settings_fingerprint != self.settings.output_fingerprint() {
            status.message = format!("build settings changed since {}; running full build", prior_id);
            tracing::info!(prior = %prior_id, "build settings changed; running full build");
            return None;
        }
        status.build_mode = BuildMode::Incremental;
        status.message = format!("incremental build against {}", prior_id);
        Some((prior_id, prior))
    }

    fn full_build(
        &self,
        dir: &Path,
        version: &str,
        schema: &Arc<SchemaSet>,
        sources: &[Arc<dyn SourceProvider>],
        cancel: &CancelToken,
    ) -> Result<String, KgError> {
        let manifests = self.write_partitions(dir, schema, sources, cancel)?;
        self.write_type_definitions(dir, schema)?;
        cancel.check()?;
        let metadata = GraphMetadata::aggregate(
            version,
            schema.fingerprint(),
            &self.settings.output_fingerprint(),
            &self.settings.formats,
            &manifests,
        );
        metadata.save(dir)?;
        Ok(format!(
            "full build completed: {} nodes, {} edges from {} sources",
            metadata.node_count,
            metadata.edge_count,
            manifests.len()
        ))
    }

    fn incremental_build(
        &self,
        dir: &Path,
        schema: &Arc<SchemaSet>,
        sources: &[Arc<dyn SourceProvider>],
        configured: Option<&BTreeSet<String>>,
        prior_id: &str,
        prior: &GraphMetadata,
        cancel: &CancelToken,
    ) -> Result<String, KgError> {
        let changed: Vec<Arc<dyn SourceProvider>> = sources
            .iter()
            .filter(|p| {
                let d = p.descriptor();
                prior
                    .partitions
                    .get(&d.partition)
                    .is_none_or(|c| c.fingerprint != d.fingerprint || c.source != d.name)
            })
            .cloned()
            .collect();
        let current: BTreeSet<&str> = match configured {
            Some(partitions) => partitions.iter().map(String::as_str).collect(),
            None => sources
                .iter()
                .map(|p| p.descriptor().partition.as_str())
                .collect(),
        };
        let removed: Vec<String> = prior
            .partitions
            .keys()
            .filter(|p| !current.contains(p.as_str()))
            .cloned()
            .collect();
        let replaced = changed
            .iter()
            .filter(|p| prior.partitions.contains_key(&p.descriptor().partition))
            .count();
        let carried = prior
            .partitions
            .len()
            .saturating_sub(removed.len() + replaced);
        let mut touched: Vec<String> = changed
            .iter()
            .map(|p| p.descriptor().partition.clone())
            .collect();
        touched.extend(removed.iter().cloned());
        tracing::info!(
            prior = prior_id,
            changed = changed.len(),
            removed = removed.len(),
            carried,
            "incremental build plan"
        );

        let scratch = dir.join(PARTIAL_OUTPUT_DIR);
        self.write_partitions(&scratch, schema, &changed, cancel)?;
        cancel.check()?;

        let skip: BTreeSet<&str> = touched.iter().map(String::as_str).collect();
        copy_version(&self.store.version_dir(prior_id), dir, &skip, cancel)?;
        for partition in changed.iter().map(|p| &p.descriptor().partition) {
            let target = dir.join(partition);
            if target.exists() {
                fs::remove_dir_all(&target).map_err(|e| KgError::io(target.display(), e))?;
            }
            let staged = scratch.join(partition);
            fs::rename(&staged, &target).map_err(|e| KgError::io(staged.display(), e))?;
        }
        discard_scratch(dir);
        self.write_type_definitions(dir, schema)?;

        let mut metadata = recompute_delta(dir, prior, &touched)?;
        metadata.formats.clone_from(&self.settings.formats);
        metadata.settings_fingerprint = self.settings.output_fingerprint();
        metadata.save(dir)?;
        let mut message = format!(
            "incremental build completed: {} changed, {} removed partitions",
            changed.len(),
            removed.len()
        );
        if !metadata.merge_flags.is_empty() {
            message.push_str(&format!(
                "; {} merge inconsistencies flagged",
                metadata.merge_flags.len()
            ));
        }
        Ok(message)
    }

    /// Run `sources` in parallel, one partition each under `out_root`.
    fn write_partitions(
        &self,
        out_root: &Path,
        schema: &Arc<SchemaSet>,
        sources: &[Arc<dyn SourceProvider>],
        cancel: &CancelToken,
    ) -> Result<Vec<PartitionManifest>, KgError> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let registries: BTreeMap<Format, Arc<IdRegistry>> = self
            .settings
            .formats
            .iter()
            .map(|f| (*f, Arc::new(IdRegistry::new())))
            .collect();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.parallelism)
            .thread_name(|i| format!("kgforge-build-{}", i))
            .build()
            .map_err(|e| KgError::BuildError(e.to_string()))?;

        // Stops sibling sources once one of them failed.
        let stop = CancelToken::new();
        let results: Vec<Result<PartitionManifest, KgError>> = pool.install(|| {
            sources
                .par_iter()
                .map(|provider| {
                    let result =
                        self.write_partition(out_root, schema, provider.as_ref(), &registries, cancel, &stop);
                    if result.is_err() {
                        stop.cancel();
                    }
                    result
                })
                .collect()
        });

        if cancel.is_cancelled() {
            return Err(KgError::Cancelled);
        }
        let mut manifests = Vec::with_capacity(results.len());
        let mut cancelled = false;
        for result in results {
            match result {
                Ok(manifest) => manifests.push(manifest),
                Err(KgError::Cancelled) => cancelled = true,
                Err(e) => return Err(e),
            }
        }
        if cancelled {
            return Err(KgError::Cancelled);
        }
        Ok(manifests)
    }

    fn write_partition(
        &self,
        out_root: &Path,
        schema: &Arc<SchemaSet>,
        provider: &dyn SourceProvider,
        registries: &BTreeMap<Format, Arc<IdRegistry>>,
        cancel: &CancelToken,
        stop: &CancelToken,
    ) -> Result<PartitionManifest, KgError> {
        let descriptor = provider.descriptor();
        let partition_dir = out_root.join(&descriptor.partition);
        if partition_dir.exists() {
            fs::remove_dir_all(&partition_dir)
                .map_err(|e| KgError::io(partition_dir.display(), e))?;
        }

        let mut sessions = Vec::with_capacity(self.settings.formats.len());
        for format in &self.settings.formats {
            let mut options = self.settings.writer_options(*format, &descriptor.partition)?;
            if self.settings.provenance {
                options.provenance.clone_from(&descriptor.provenance);
            }
            let mut session = WriterSession::open(Arc::clone(schema), &partition_dir, options)?
                .with_cancel(stop.clone());
            if let Some(ids) = registries.get(format) {
                session = session.with_id_registry(Arc::clone(ids));
            }
            sessions.push(session);
        }

        if let Err(e) = feed(provider, &mut sessions, cancel, stop) {
            for session in sessions {
                session.abort();
            }
            return Err(e);
        }
        let manifests = sessions
            .into_iter()
            .map(WriterSession::close)
            .collect::<Result<Vec<_>, _>>()?;

        let manifest = PartitionManifest::from_manifests(descriptor, &manifests);
        manifest.save(&partition_dir)?;
        tracing::info!(
            source = %descriptor.name,
            partition = %descriptor.partition,
            nodes = manifest.node_counts.values().sum::<u64>(),
            edges = manifest.edge_counts.values().sum::<u64>(),
            rejected = manifest.rejected,
            "source written"
        );
        if manifest.rejected > 0 {
            tracing::warn!(source = %descriptor.name, rejected = manifest.rejected, "records rejected");
        }
        Ok(manifest)
    }

    fn write_type_definitions(&self, dir: &Path, schema: &SchemaSet) -> Result<(), KgError> {
        for format in &self.settings.formats {
            if let Some((name, contents)) = format.encoder().type_definitions(schema) {
                write_atomic(&dir.join(name), contents.as_bytes())?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Stream one source into every session.
fn feed(
    provider: &dyn SourceProvider,
    sessions: &mut [WriterSession],
    cancel: &CancelToken,
    stop: &CancelToken,
) -> Result<(), KgError> {
    let descriptor = provider.descriptor();
    let wrap = |e: KgError| match e {
        KgError::Cancelled => KgError::Cancelled,
        other => KgError::Source {
            source_name: descriptor.name.clone(),
            reason: other.to_string(),
        },
    };
    let checkpoint = || {
        if cancel.is_cancelled() {
            stop.cancel();
        }
        stop.check()
    };

    let mut source = provider.open().map_err(wrap)?;
    if descriptor.write_nodes {
        for item in source.nodes().map_err(wrap)? {
            checkpoint()?;
            write_all(sessions, Record::Node(item.map_err(wrap)?))?;
        }
    }
    if descriptor.write_edges {
        for item in source.edges().map_err(wrap)? {
            checkpoint()?;
            write_all(sessions, Record::Edge(item.map_err(wrap)?))?;
        }
    }
    checkpoint()
}

fn write_all(sessions: &mut [WriterSession], record: Record) -> Result<(), KgError> {
    let Some((last, rest)) = sessions.split_last_mut() else {
        return Ok(());
    };
    for session in rest {
        session.write(record.clone())?;
    }
    last.write(record)?;
    Ok(())
}

/// A partition name is a non-empty run of `[A-Za-z0-9_-]`, so it can never
/// collide with a version-level file or a hidden scratch directory.
#[must_use]
pub fn is_valid_partition(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// Partitions must be unique valid names, and inside `configured` when given.
fn check_partitions(
    sources: &[Arc<dyn SourceProvider>],
    configured: Option<&BTreeSet<String>>,
) -> Result<(), KgError> {
    if let Some(invalid) = configured
        .into_iter()
        .flatten()
        .find(|p| !is_valid_partition(p))
    {
        return Err(KgError::InvalidConfig(format!(
            "invalid configured partition '{}'",
            invalid
        )));
    }
    let mut names = BTreeSet::new();
    let mut partitions = BTreeSet::new();
    for provider in sources {
        let d = provider.descriptor();
        if !is_valid_partition(&d.partition) {
            return Err(KgError::InvalidConfig(format!(
                "source '{}': invalid partition '{}'",
                d.name, d.partition
            )));
        }
        if configured.is_some_and(|set| !set.contains(&d.partition)) {
            return Err(KgError::InvalidConfig(format!(
                "source '{}': partition '{}' is not configured",
                d.name, d.partition
            )));
        }
        if !names.insert(d.name.as_str()) {
            return Err(KgError::InvalidConfig(format!("duplicate source '{}'", d.name)));
        }
        if !partitions.insert(d.partition.as_str()) {
            return Err(KgError::InvalidConfig(format!(
                "partition '{}' claimed by more than one source",
                d.partition
            )));
        }
    }
    Ok(())
}

/// Copy a prior version's partitions, skipping `skip` and version-level
/// artifacts that get rewritten.
fn copy_version(
    from: &Path,
    to: &Path,
    skip: &BTreeSet<&str>,
    cancel: &CancelToken,
) -> Result<(), KgError> {
    let top_level_excluded = |name: &str| {
        name.starts_with('.')
            || name == BUILD_STATUS_FILE
            || name == GRAPH_METADATA_FILE
            || skip.contains(name)
    };
    let walker = WalkDir::new(from)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !top_level_excluded(&e.file_name().to_string_lossy()));
    let mut copied = 0u64;
    for entry in walker {
        let entry = entry.map_err(|e| KgError::io(from.display(), e))?;
        cancel.check()?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| KgError::BuildError(e.to_string()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| KgError::io(target.display(), e))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| KgError::io(parent.display(), e))?;
            }
            fs::copy(entry.path(), &target).map_err(|e| KgError::io(target.display(), e))?;
            copied += 1;
        }
    }
    tracing::debug!(from = %from.display(), files = copied, "baseline copied");
    Ok(())
}

fn discard_scratch(version_dir: &Path) {
    let scratch = version_dir.join(PARTIAL_OUTPUT_DIR);
    if scratch.exists()
        && let Err(e) = fs::remove_dir_all(&scratch)
    {
        tracing::warn!(path = %scratch.display(), error = %e, "failed to remove scratch output");
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceDescriptor, StaticProvider, VecSource};
    use crate::types::{EdgeRecord, NodeRecord};

    const SCHEMA: &str = r"
gene:
  represented_as: node
  input_label: gene
  properties:
    chr: str
transcript:
  represented_as: node
  input_label: transcript
transcribed_to:
  represented_as: edge
  input_label: transcribed_to
  source: gene
  target: transcript
";

    fn setup() -> (tempfile::TempDir, BuildController) {
        let dir = tempfile::tempdir().expect("tempdir");
        let schema = dir.path().join("schema.yaml");
        fs::write(&schema, SCHEMA).expect("schema");
        let settings = BuildSettings::new(dir.path().join("versions"), schema);
        let controller = BuildController::new(settings).expect("controller");
        (dir, controller)
    }

    fn provider(name: &str, fingerprint: &str, genes: usize) -> Arc<dyn SourceProvider> {
        let nodes = (0..genes)
            .map(|i| NodeRecord::new(format!("G{}", i), "gene").with("chr", "chr1"))
            .collect();
        let edges = vec![EdgeRecord::new(
            "transcribed_to",
            ("gene", "G0"),
            ("transcript", "T0"),
        )];
        Arc::new(StaticProvider::new(
            SourceDescriptor {
                name: name.into(),
                partition: name.into(),
                fingerprint: fingerprint.into(),
                write_nodes: true,
                write_edges: true,
                provenance: None,
            },
            VecSource::new(nodes, edges),
        ))
    }

    #[test]
    fn settings_reject_zero_parallelism() {
        let mut settings = BuildSettings::new("/tmp/v", "/tmp/s.yaml");
        settings.parallelism = 0;
        assert!(settings.validate().is_err());
        settings.parallelism = 1;
        settings.formats = vec![Format::Atoms, Format::Atoms];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn full_build_completes_and_advances_latest() {
        let (_dir, controller) = setup();
        let request = BuildRequest::new(BuildMode::Full).with_version("v1");
        let status = controller
            .build(&request, &[provider("gencode", "a", 3)], &CancelToken::new())
            .expect("build");
        assert_eq!(status.status, BuildState::Completed, "{}", status.message);
        assert_eq!(controller.store().latest().as_deref(), Some("v1"));

        let root = controller.store().version_dir("v1");
        assert!(root.join("gencode/nodes_gene.csv").exists());
        assert!(root.join("gencode/nodes_gene.metta").exists());
        assert!(root.join("gencode/nodes_gene.pl").exists());
        assert!(root.join("type_defs.metta").exists());
        let metadata = GraphMetadata::load(&GraphMetadata::path(&root)).expect("metadata");
        assert_eq!(metadata.node_counts["gene"], 3);
        assert_eq!(metadata.edge_counts["transcribed_to"], 1);
    }

    #[test]
    fn completed_version_is_immutable() {
        let (_dir, controller) = setup();
        let request = BuildRequest::new(BuildMode::Full).with_version("v1");
        controller
            .build(&request, &[provider("gencode", "a", 1)], &CancelToken::new())
            .expect("build");
        assert!(controller.request(&request).is_err());
    }

    #[test]
    fn cancelled_build_never_completes() {
        let (_dir, controller) = setup();
        let request = BuildRequest::new(BuildMode::Full).with_version("v1");
        controller.request(&request).expect("queued");
        let cancel = CancelToken::new();
        cancel.cancel();
        let status = controller
            .run("v1", &[provider("gencode", "a", 2)], &cancel)
            .expect("run");
        assert_eq!(status.status, BuildState::Cancelled);
        assert_eq!(controller.store().latest(), None);
    }

    #[test]
    fn schema_failure_marks_version_failed() {
        let (dir, controller) = setup();
        fs::write(dir.path().join("schema.yaml"), "a:\n  is_a: missing\n").expect("schema");
        let request = BuildRequest::new(BuildMode::Full).with_version("v1");
        let status = controller
            .build(&request, &[provider("gencode", "a", 1)], &CancelToken::new())
            .expect("build");
        assert_eq!(status.status, BuildState::Failed);
        assert!(status.message.contains("missing"));
        let persisted = controller.status(Some("v1")).expect("status").expect("present");
        assert_eq!(persisted.status, BuildState::Failed);
    }

    #[test]
    fn duplicate_partitions_fail_the_build() {
        let (_dir, controller) = setup();
        let request = BuildRequest::new(BuildMode::Full).with_version("v1");
        let a = provider("gencode", "a", 1);
        let status = controller
            .build(&request, &[Arc::clone(&a), a], &CancelToken::new())
            .expect("build");
        assert_eq!(status.status, BuildState::Failed);
    }

    #[test]
    fn incremental_reruns_only_changed_sources() {
        let (_dir, controller) = setup();
        let cancel = CancelToken::new();
        controller
            .build(
                &BuildRequest::new(BuildMode::Full).with_version("v1"),
                &[provider("gencode", "a", 3), provider("uniprot", "b", 2)],
                &cancel,
            )
            .expect("v1");

        let status = controller
            .build(
                &BuildRequest::new(BuildMode::Incremental).with_version("v2"),
                &[provider("gencode", "a2", 5), provider("uniprot", "b", 2)],
                &cancel,
            )
            .expect("v2");
        assert_eq!(status.status, BuildState::Completed, "{}", status.message);
        assert_eq!(status.build_mode, BuildMode::Incremental);

        let root = controller.store().version_dir("v2");
        assert!(root.join("uniprot/nodes_gene.csv").exists());
        assert!(!root.join(PARTIAL_OUTPUT_DIR).exists());
        let metadata = GraphMetadata::load(&GraphMetadata::path(&root)).expect("metadata");
        assert_eq!(metadata.node_counts["gene"], 7);
        assert_eq!(metadata.partitions["gencode"].fingerprint, "a2");
        assert_eq!(controller.store().latest().as_deref(), Some("v2"));
    }

    #[test]
    fn subset_incremental_carries_unselected_partitions() {
        let (_dir, controller) = setup();
        let cancel = CancelToken::new();
        controller
            .build(
                &BuildRequest::new(BuildMode::Full).with_version("v1"),
                &[provider("gencode", "a", 3), provider("uniprot", "b", 2)],
                &cancel,
            )
            .expect("v1");

        let request = BuildRequest::new(BuildMode::Incremental)
            .with_version("v2")
            .with_configured_partitions(["gencode", "uniprot"]);
        let status = controller
            .build(&request, &[provider("gencode", "a2", 4)], &cancel)
            .expect("v2");
        assert_eq!(status.status, BuildState::Completed, "{}", status.message);
        assert_eq!(status.build_mode, BuildMode::Incremental);

        let root = controller.store().version_dir("v2");
        assert!(root.join("uniprot/nodes_gene.csv").exists());
        let metadata = GraphMetadata::load(&GraphMetadata::path(&root)).expect("metadata");
        assert_eq!(metadata.node_counts["gene"], 6);
        assert_eq!(metadata.partitions["uniprot"].fingerprint, "b");
        assert_eq!(metadata.partitions["gencode"].fingerprint, "a2");
    }

    #[test]
    fn partitions_dropped_from_configuration_are_removed() {
        let (_dir, controller) = setup();
        let cancel = CancelToken::new();
        controller
            .build(
                &BuildRequest::new(BuildMode::Full).with_version("v1"),
                &[provider("gencode", "a", 3), provider("uniprot", "b", 2)],
                &cancel,
            )
            .expect("v1");

        let request = BuildRequest::new(BuildMode::Incremental)
            .with_version("v2")
            .with_configured_partitions(["gencode"]);
        let status = controller
            .build(&request, &[provider("gencode", "a", 3)], &cancel)
            .expect("v2");
        assert_eq!(status.status, BuildState::Completed, "{}", status.message);

        let root = controller.store().version_dir("v2");
        assert!(!root.join("uniprot").exists());
        let metadata = GraphMetadata::load(&GraphMetadata::path(&root)).expect("metadata");
        assert_eq!(metadata.node_counts["gene"], 3);
        assert!(!metadata.partitions.contains_key("uniprot"));
    }

    #[test]
    fn unconfigured_source_fails_the_build() {
        let (_dir, controller) = setup();
        let request = BuildRequest::new(BuildMode::Full)
            .with_version("v1")
            .with_configured_partitions(["uniprot"]);
        let status = controller
            .build(&request, &[provider("gencode", "a", 1)], &CancelToken::new())
            .expect("build");
        assert_eq!(status.status, BuildState::Failed);
        assert!(status.message.contains("not configured"), "{}", status.message);
    }

    #[test]
    fn changed_output_settings_force_full_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let schema = dir.path().join("schema.yaml");
        fs::write(&schema, SCHEMA).expect("schema");
        let mut settings = BuildSettings::new(dir.path().join("versions"), &schema);
        settings.formats = vec![Format::Tabular];
        let cancel = CancelToken::new();
        BuildController::new(settings.clone())
            .expect("controller")
            .build(
                &BuildRequest::new(BuildMode::Full).with_version("v1"),
                &[provider("gencode", "a", 3), provider("uniprot", "b", 2)],
                &cancel,
            )
            .expect("v1");

        settings.formats = vec![Format::Tabular, Format::Atoms];
        let controller = BuildController::new(settings).expect("controller");
        let status = controller
            .build(
                &BuildRequest::new(BuildMode::Incremental).with_version("v2"),
                &[provider("gencode", "a2", 3), provider("uniprot", "b", 2)],
                &cancel,
            )
            .expect("v2");
        assert_eq!(status.status, BuildState::Completed, "{}", status.message);
        assert_eq!(status.build_mode, BuildMode::Full);

        let root = controller.store().version_dir("v2");
        assert!(root.join("uniprot/nodes_gene.metta").exists());
        let metadata = GraphMetadata::load(&GraphMetadata::path(&root)).expect("metadata");
        assert_eq!(metadata.formats, [Format::Tabular, Format::Atoms]);
    }

    #[test]
    fn output_fingerprint_ignores_format_order_and_parallelism() {
        let mut a = BuildSettings::new("/tmp/v", "/tmp/s.yaml");
        let mut b = a.clone();
        b.formats.reverse();
        b.parallelism = 9;
        assert_eq!(a.output_fingerprint(), b.output_fingerprint());
        a.duplicate_policy = DuplicatePolicy::Reject;
        assert_ne!(a.output_fingerprint(), b.output_fingerprint());
    }

    #[test]
    fn partition_names_exclude_dots_and_separators() {
        assert!(is_valid_partition("gencode_v44-human"));
        assert!(!is_valid_partition("graph_info.json"));
        assert!(!is_valid_partition("type_defs.metta"));
        assert!(!is_valid_partition("a/b"));
        assert!(!is_valid_partition(""));
    }

    #[test]
    fn dotted_partition_fails_the_build() {
        let (_dir, controller) = setup();
        let dotted: Arc<dyn SourceProvider> = Arc::new(StaticProvider::new(
            SourceDescriptor {
                name: "clash".into(),
                partition: "build_status.json".into(),
                fingerprint: "a".into(),
                write_nodes: true,
                write_edges: false,
                provenance: None,
            },
            VecSource::new(vec![NodeRecord::new("G1", "gene")], Vec::new()),
        ));
        let status = controller
            .build(
                &BuildRequest::new(BuildMode::Full).with_version("v1"),
                &[dotted],
                &CancelToken::new(),
            )
            .expect("build");
        assert_eq!(status.status, BuildState::Failed);
        assert!(status.message.contains("invalid partition"), "{}", status.message);
    }

    #[test]
    fn incremental_without_prior_falls_back_to_full() {
        let (_dir, controller) = setup();
        let status = controller
            .build(
                &BuildRequest::new(BuildMode::Incremental).with_version("v1"),
                &[provider("gencode", "a", 1)],
                &CancelToken::new(),
            )
            .expect("build");
        assert_eq!(status.status, BuildState::Completed);
        assert_eq!(status.build_mode, BuildMode::Full);
        assert_eq!(status.requested_mode, BuildMode::Incremental);
    }

    #[test]
    fn failed_version_can_be_retried() {
        let (dir, controller) = setup();
        let schema = dir.path().join("schema.yaml");
        fs::write(&schema, "broken: [").expect("schema");
        let request = BuildRequest::new(BuildMode::Full).with_version("v1");
        let first = controller
            .build(&request, &[provider("gencode", "a", 1)], &CancelToken::new())
            .expect("first");
        assert_eq!(first.status, BuildState::Failed);

        fs::write(&schema, SCHEMA).expect("schema");
        let second = controller
            .build(&request, &[provider("gencode", "a", 1)], &CancelToken::new())
            .expect("second");
        assert_eq!(second.status, BuildState::Completed);
    }
}
