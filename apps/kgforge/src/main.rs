//! # kgforge - Knowledge Graph Builder
//!
//! Command-line front end for `kgforge-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  apps/kgforge (THE BINARY)               │
//! │                                                          │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   │
//! │  │    CLI      │   │   Config     │   │  Adapters    │   │
//! │  │   (clap)    │   │   (toml)     │   │ jsonl / http │   │
//! │  └──────┬──────┘   └──────┬───────┘   └──────┬───────┘   │
//! │         └─────────────────┼──────────────────┘           │
//! │                           ▼                              │
//! │                   ┌───────────────┐                      │
//! │                   │ kgforge-core  │                      │
//! │                   │  (THE LOGIC)  │                      │
//! │                   └───────────────┘                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! kgforge build --mode incremental
//! kgforge status
//! kgforge mapping refresh hgnc --force
//! kgforge merge-metadata out/v2 out/v1/graph_info.json --changed gencode
//! ```

mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // KGFORGE_LOG_FORMAT=json switches to machine-parseable logs.
    let log_format = std::env::var("KGFORGE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kgforge=info,kgforge_core=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        r#"
  ┬┌─┌─┐┌─┐┌─┐┬─┐┌─┐┌─┐
  ├┴┐│ ┬├┤ │ │├┬┘│ ┬├┤
  ┴ ┴└─┘└  └─┘┴└─└─┘└─┘

  Knowledge Graph Builder v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
