//! # kgforge-core
//!
//! Schema-driven knowledge-graph assembly for kgforge - THE LOGIC.
//!
//! Heterogeneous biomedical sources become typed node and edge records, are
//! validated against an inherited type hierarchy and written into versioned
//! build directories in three interchangeable formats.
//!
//! ## Components (dependency order)
//!
//! - `schema`: resolves the YAML type hierarchy into effective schemas
//! - `source`: record model boundary implemented by every data source
//! - `writer`: validating, batching multi-format writer sessions
//! - `mapping`: identifier mapping tables with refresh policies
//! - `build`: versioned full and incremental builds, delta metadata
//!
//! ## Constraints
//!
//! - Synchronous; parallelism comes from `rayon` inside the build controller
//! - No network dependencies: remote mapping sources live in the app
//! - Emitted files are the only persistent output besides mapping caches

// =============================================================================
// MODULES
// =============================================================================

pub mod build;
pub mod mapping;
pub mod primitives;
pub mod schema;
pub mod source;
pub mod types;
pub mod writer;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{
    CancelToken, EdgeRecord, KgError, MappingError, NodeRecord, Properties, PropertyValue,
    Provenance, Record, Representation, SchemaError, SemanticType,
};

// =============================================================================
// RE-EXPORTS: Schema & Sources
// =============================================================================

pub use schema::{EffectiveSchema, SchemaSet, Violation};
pub use source::{Source, SourceDescriptor, SourceProvider, StaticProvider, VecSource};

// =============================================================================
// RE-EXPORTS: Writer
// =============================================================================

pub use writer::{
    DuplicatePolicy, Format, Manifest, WriteOutcome, WriterOptions, WriterSession,
};

// =============================================================================
// RE-EXPORTS: Mapping
// =============================================================================

pub use mapping::{
    DelimitedTransform, FileMappingSource, FreshStatus, MappingCache, MappingSource,
    MappingTable, RefreshPolicy, RemoteMarker,
};

// =============================================================================
// RE-EXPORTS: Build
// =============================================================================

pub use build::{
    BuildController, BuildMode, BuildRequest, BuildSettings, BuildState, BuildStatus,
    GraphMetadata, RequestOutcome, VersionStore, recompute_delta,
};
