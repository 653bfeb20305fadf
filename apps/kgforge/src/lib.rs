//! # kgforge
//!
//! Application layer of the kgforge knowledge-graph builder: project
//! configuration, bundled record adapters, the HTTP mapping source and git
//! checkout identification. The engine itself lives in `kgforge-core`.

pub mod adapters;
pub mod checkout;
pub mod config;
pub mod remote;

pub use adapters::JsonLinesProvider;
pub use checkout::Checkout;
pub use config::{Config, MappingConfig, SourceConfig};
pub use remote::HttpMappingSource;
