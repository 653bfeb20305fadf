//! # CLI Command Implementations

use kgforge::{Checkout, Config};
use kgforge_core::build::{Liveness, VersionEntry};
use kgforge_core::{
    BuildController, BuildMode, BuildState, BuildStatus, CancelToken, FreshStatus,
    GraphMetadata, KgError, SchemaSet, VersionStore, recompute_delta,
};
use std::path::{Path, PathBuf};

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

fn config_dir(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

// =============================================================================
// BUILD COMMAND
// =============================================================================

/// Run a build on a blocking thread; Ctrl-C cancels it cooperatively.
pub async fn cmd_build(
    config_path: PathBuf,
    json_mode: bool,
    mode: BuildMode,
    version: Option<String>,
    log_file: Option<PathBuf>,
) -> Result<(), KgError> {
    let cancel = CancelToken::new();
    let mut task = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            run_build(&config_path, mode, version, log_file, &cancel)
        })
    };

    let joined = tokio::select! {
        joined = &mut task => joined,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::warn!("interrupt received, cancelling build");
                    cancel.cancel();
                }
                Err(e) => tracing::warn!("cannot listen for interrupts: {}", e),
            }
            task.await
        }
    };
    let status = joined.map_err(|e| KgError::BuildError(format!("build task failed: {}", e)))??;

    print_status(&status, Liveness::NotRunning, json_mode);
    match status.status {
        BuildState::Completed => Ok(()),
        BuildState::Running | BuildState::Queued => Err(KgError::BuildError(format!(
            "version {} is already being built",
            status.version
        ))),
        BuildState::Failed | BuildState::Cancelled => Err(KgError::BuildError(format!(
            "version {} {}: {}",
            status.version, status.status, status.message
        ))),
    }
}

fn run_build(
    config_path: &Path,
    mode: BuildMode,
    version: Option<String>,
    log_file: Option<PathBuf>,
    cancel: &CancelToken,
) -> Result<BuildStatus, KgError> {
    let config = Config::load(config_path)?;
    let controller = BuildController::new(config.build.clone())?;
    let providers = config.providers()?;
    let checkout = Checkout::discover(config_dir(config_path));

    let mut request = config.build_request(mode);
    request.version = version;
    request.commit = checkout.commit;
    request.branch = checkout.branch;
    request.log_file = log_file;

    tracing::info!(
        mode = %mode,
        sources = providers.len(),
        "starting build"
    );
    controller.build(&request, &providers, cancel)
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show a version's status document.
pub fn cmd_status(config_path: &Path, json_mode: bool, version: Option<&str>) -> Result<(), KgError> {
    let config = Config::load(config_path)?;
    let controller = BuildController::new(config.build)?;

    let Some(status) = controller.status(version)? else {
        let what = version.map_or_else(|| "latest".to_string(), str::to_string);
        if json_mode {
            print_json(&serde_json::json!({ "version": what, "status": null }));
        } else {
            println!("No build status for {}", what);
        }
        return Ok(());
    };
    let liveness = status.liveness();
    print_status(&status, liveness, json_mode);
    Ok(())
}

fn liveness_label(liveness: Liveness) -> &'static str {
    match liveness {
        Liveness::NotRunning => "not_running",
        Liveness::Live => "live",
        Liveness::Orphaned => "orphaned",
        Liveness::Unknown => "unknown",
    }
}

fn print_status(status: &BuildStatus, liveness: Liveness, json_mode: bool) {
    if json_mode {
        let mut value = serde_json::to_value(status).unwrap_or_default();
        if let Some(object) = value.as_object_mut() {
            object.insert("liveness".to_string(), liveness_label(liveness).into());
        }
        print_json(&value);
        return;
    }

    println!("kgforge Build Status");
    println!("====================");
    println!("Version:   {}", status.version);
    println!("Status:    {}", status.status);
    println!("Mode:      {} (requested {})", status.build_mode, status.requested_mode);
    if let Some(commit) = &status.commit {
        println!("Commit:    {}", commit);
    }
    if let Some(branch) = &status.branch {
        println!("Branch:    {}", branch);
    }
    println!("Created:   {}", status.created_at.to_rfc3339());
    if let Some(finished) = status.finished_at {
        println!("Finished:  {}", finished.to_rfc3339());
    }
    if liveness == Liveness::Orphaned {
        println!("Process:   {} (gone; the version can be rebuilt)", status.pid);
    }
    if !status.message.is_empty() {
        println!();
        println!("{}", status.message);
    }
}

// =============================================================================
// VERSIONS & PRUNE
// =============================================================================

/// List versions oldest first, marking `latest`.
pub fn cmd_versions(config_path: &Path, json_mode: bool) -> Result<(), KgError> {
    let config = Config::load(config_path)?;
    let store = VersionStore::new(&config.build.versions_root);
    let entries = store.list()?;
    let latest = store.latest();

    if json_mode {
        let versions: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| version_json(entry, latest.as_deref()))
            .collect();
        print_json(&serde_json::json!({ "latest": latest, "versions": versions }));
        return Ok(());
    }

    if entries.is_empty() {
        println!("No versions under {}", store.root().display());
        return Ok(());
    }
    println!("{:<26} {:<10} CREATED", "VERSION", "STATUS");
    for entry in &entries {
        let marker = if latest.as_deref() == Some(entry.id.as_str()) {
            "  <- latest"
        } else {
            ""
        };
        let state = entry.status.to_string();
        println!(
            "{:<26} {:<10} {}{}",
            entry.id,
            state,
            entry.created_at.to_rfc3339(),
            marker
        );
    }
    Ok(())
}

fn version_json(entry: &VersionEntry, latest: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "id": entry.id,
        "status": entry.status,
        "created_at": entry.created_at,
        "latest": latest == Some(entry.id.as_str()),
    })
}

/// Apply the configured retention.
pub fn cmd_prune(config_path: &Path, json_mode: bool) -> Result<(), KgError> {
    let config = Config::load(config_path)?;
    let store = VersionStore::new(&config.build.versions_root);
    let removed = store.prune(config.build.retention)?;

    if json_mode {
        print_json(&serde_json::json!({
            "retention": config.build.retention,
            "removed": removed,
        }));
    } else if removed.is_empty() {
        println!("Nothing to prune (retention {})", config.build.retention);
    } else {
        for id in &removed {
            println!("Removed {}", id);
        }
    }
    Ok(())
}

// =============================================================================
// SCHEMA COMMAND
// =============================================================================

/// Resolve the configured schema and summarise it.
pub fn cmd_schema_check(config_path: &Path, json_mode: bool) -> Result<(), KgError> {
    let config = Config::load(config_path)?;
    let schema = SchemaSet::load_path(&config.build.schema)?;

    if json_mode {
        let types: Vec<serde_json::Value> = schema
            .types()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "representation": t.representation.to_string(),
                    "output_label": t.output_label,
                    "properties": t.properties.len(),
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "schema": config.build.schema.to_string_lossy(),
            "fingerprint": schema.fingerprint(),
            "types": types,
        }));
        return Ok(());
    }

    println!("Schema:      {}", config.build.schema.display());
    println!("Fingerprint: {}", schema.fingerprint());
    println!("Types:       {}", schema.len());
    println!();
    for t in schema.types() {
        let endpoints = if t.source_types.is_empty() {
            String::new()
        } else {
            format!(
                "  ({} -> {})",
                t.source_types.join("|"),
                t.target_types.join("|")
            )
        };
        let representation = t.representation.to_string();
        println!(
            "  {:<5} {:<32} {} properties{}",
            representation,
            t.output_label,
            t.properties.len(),
            endpoints
        );
    }
    Ok(())
}

// =============================================================================
// MAPPING COMMANDS
// =============================================================================

/// Refresh one mapping, under its policy unless forced.
pub fn cmd_mapping_refresh(
    config_path: &Path,
    json_mode: bool,
    name: &str,
    force: bool,
) -> Result<(), KgError> {
    let config = Config::load(config_path)?;
    let cache = config.open_mapping(name)?;
    let outcome = if force {
        cache.force_refresh()?
    } else {
        cache.ensure_fresh(&config.mapping_config(name)?.policy)?
    };
    let version = cache.version();

    if json_mode {
        print_json(&serde_json::json!({
            "mapping": name,
            "outcome": fresh_label(outcome),
            "version": version,
        }));
        return Ok(());
    }

    println!("Mapping {}: {}", name, fresh_label(outcome));
    if let Some(version) = version {
        println!("  Entries:   {}", version.entries);
        println!("  Refreshed: {}", version.refreshed_at.to_rfc3339());
    }
    Ok(())
}

fn fresh_label(status: FreshStatus) -> &'static str {
    match status {
        FreshStatus::Fresh => "fresh",
        FreshStatus::Refreshed => "refreshed",
        FreshStatus::StaleFallback => "stale (refresh failed, serving previous table)",
    }
}

/// Show cached mapping versions without refreshing.
pub fn cmd_mapping_status(
    config_path: &Path,
    json_mode: bool,
    name: Option<&str>,
) -> Result<(), KgError> {
    let config = Config::load(config_path)?;
    let selected = match name {
        Some(name) => vec![config.mapping_config(name)?],
        None => config.mappings.iter().collect(),
    };

    let mut rows = Vec::with_capacity(selected.len());
    for mapping in selected {
        let cache = config.open_mapping(&mapping.name)?;
        rows.push((mapping, cache.version()));
    }

    if json_mode {
        let mappings: Vec<serde_json::Value> = rows
            .iter()
            .map(|(mapping, version)| {
                serde_json::json!({
                    "name": mapping.name,
                    "policy": mapping.policy,
                    "version": version,
                })
            })
            .collect();
        print_json(&serde_json::json!({ "mappings": mappings }));
        return Ok(());
    }

    if rows.is_empty() {
        println!("No mappings configured");
        return Ok(());
    }
    for (mapping, version) in rows {
        match version {
            Some(v) => println!(
                "{:<20} {:>10} entries  refreshed {}",
                mapping.name,
                v.entries,
                v.refreshed_at.to_rfc3339()
            ),
            None => println!("{:<20} {:>10}", mapping.name, "empty"),
        }
    }
    Ok(())
}

/// Look up one key in a mapping's cached table.
pub fn cmd_mapping_lookup(
    config_path: &Path,
    json_mode: bool,
    name: &str,
    key: &str,
) -> Result<(), KgError> {
    let config = Config::load(config_path)?;
    let cache = config.open_mapping(name)?;
    let value = cache.lookup(key);

    if json_mode {
        print_json(&serde_json::json!({ "mapping": name, "key": key, "value": value }));
        return Ok(());
    }
    match value {
        Some(value) => println!("{}", value),
        None => println!("{} not found in {}", key, name),
    }
    Ok(())
}

// =============================================================================
// METADATA COMMAND
// =============================================================================

/// Recompute graph metadata for `new_version_dir` from a prior document.
pub fn cmd_merge_metadata(
    new_version_dir: &Path,
    prior: &Path,
    changed: &[String],
    json_mode: bool,
) -> Result<(), KgError> {
    let prior = GraphMetadata::load(prior)?;
    let merged = recompute_delta(new_version_dir, &prior, changed)?;
    merged.save(new_version_dir)?;

    if json_mode {
        print_json(&serde_json::json!({
            "version": merged.version,
            "node_count": merged.node_count,
            "edge_count": merged.edge_count,
            "merge_flags": merged.merge_flags.len(),
            "path": GraphMetadata::path(new_version_dir).to_string_lossy(),
        }));
        return Ok(());
    }

    println!("Metadata:  {}", GraphMetadata::path(new_version_dir).display());
    println!("Nodes:     {} (was {})", merged.node_count, prior.node_count);
    println!("Edges:     {} (was {})", merged.edge_count, prior.edge_count);
    for flag in &merged.merge_flags {
        println!(
            "  inconsistent {} {}: prior {} - removed {} + added {}",
            flag.representation, flag.type_name, flag.prior, flag.removed, flag.added
        );
    }
    Ok(())
}
