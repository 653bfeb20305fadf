//! # kgforge CLI Module
//!
//! ## Available Commands
//!
//! - `build` - Run a full or incremental build into a new version
//! - `status` - Show a version's status document (latest by default)
//! - `versions` - List build versions
//! - `prune` - Apply the retention policy
//! - `schema check` - Load and resolve the schema
//! - `mapping refresh|status|lookup` - Manage identifier mappings
//! - `merge-metadata` - Recompute graph metadata for replaced partitions

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use kgforge::config::DEFAULT_CONFIG_FILE;
use kgforge_core::{BuildMode, KgError};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// kgforge - schema-driven biomedical knowledge graph builder
#[derive(Parser, Debug)]
#[command(name = "kgforge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Project configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a new graph version
    Build {
        /// Build mode
        #[arg(short, long, value_enum, default_value_t = ModeArg::Full)]
        mode: ModeArg,

        /// Explicit version id (generated from the clock otherwise)
        #[arg(long)]
        version: Option<String>,

        /// Log file recorded in the status document
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Show build status
    Status {
        /// Version id (latest when omitted)
        version: Option<String>,
    },

    /// List build versions
    Versions,

    /// Delete versions beyond the retention policy
    Prune,

    /// Schema operations
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },

    /// Identifier mapping operations
    Mapping {
        #[command(subcommand)]
        action: MappingAction,
    },

    /// Recompute graph metadata after replacing partitions
    MergeMetadata {
        /// Version directory holding the new partition manifests
        new_version_dir: PathBuf,

        /// Prior version's graph metadata file
        prior: PathBuf,

        /// Replaced partitions (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        changed: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SchemaAction {
    /// Resolve the schema and report its types
    Check,
}

#[derive(Subcommand, Debug)]
pub enum MappingAction {
    /// Refresh a mapping under its policy
    Refresh {
        name: String,

        /// Refresh regardless of policy
        #[arg(short, long)]
        force: bool,
    },

    /// Show cached mapping versions without refreshing
    Status {
        /// Mapping name (all mappings when omitted)
        name: Option<String>,
    },

    /// Look up one key
    Lookup { name: String, key: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Full,
    Incremental,
}

impl From<ModeArg> for BuildMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => Self::Full,
            ModeArg::Incremental => Self::Incremental,
        }
    }
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), KgError> {
    let config = cli.config;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Build {
            mode,
            version,
            log_file,
        }) => cmd_build(config, json_mode, mode.into(), version, log_file).await,
        Some(Commands::Status { version }) => {
            blocking(move || cmd_status(&config, json_mode, version.as_deref())).await
        }
        None => blocking(move || cmd_status(&config, json_mode, None)).await,
        Some(Commands::Versions) => blocking(move || cmd_versions(&config, json_mode)).await,
        Some(Commands::Prune) => blocking(move || cmd_prune(&config, json_mode)).await,
        Some(Commands::Schema {
            action: SchemaAction::Check,
        }) => blocking(move || cmd_schema_check(&config, json_mode)).await,
        Some(Commands::Mapping { action }) => match action {
            MappingAction::Refresh { name, force } => {
                blocking(move || cmd_mapping_refresh(&config, json_mode, &name, force)).await
            }
            MappingAction::Status { name } => {
                blocking(move || cmd_mapping_status(&config, json_mode, name.as_deref())).await
            }
            MappingAction::Lookup { name, key } => {
                blocking(move || cmd_mapping_lookup(&config, json_mode, &name, &key)).await
            }
        },
        Some(Commands::MergeMetadata {
            new_version_dir,
            prior,
            changed,
        }) => blocking(move || cmd_merge_metadata(&new_version_dir, &prior, &changed, json_mode)).await,
    }
}

/// Run a synchronous command off the async worker threads. The blocking
/// HTTP client used by mapping refreshes must not run on them.
async fn blocking<F>(command: F) -> Result<(), KgError>
where
    F: FnOnce() -> Result<(), KgError> + Send + 'static,
{
    tokio::task::spawn_blocking(command)
        .await
        .map_err(|e| KgError::BuildError(format!("command task failed: {}", e)))?
}
