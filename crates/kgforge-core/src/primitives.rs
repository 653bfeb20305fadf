//! # Primitives
//!
//! Constants shared across the writer, mapping cache and build controller.
//! File names listed here are part of the on-disk contract of a version
//! directory; changing one breaks readers of older versions.

// =============================================================================
// WRITER
// =============================================================================

/// Records buffered per bucket before a flush.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Upper bound accepted for a configured batch size.
pub const MAX_BATCH_SIZE: usize = 1_000_000;

/// Field delimiter of tabular-graph data files.
pub const TABULAR_DELIMITER: char = '|';

/// Separator between elements of list values in tabular-graph files.
pub const TABULAR_ARRAY_DELIMITER: char = ';';

/// Property added to every record when provenance is enabled.
pub const PROVENANCE_SOURCE_KEY: &str = "source";

/// Property added to every record when provenance is enabled.
pub const PROVENANCE_URL_KEY: &str = "source_url";

/// Symbolic-atoms type declarations, written once per version.
pub const TYPE_DEFS_FILE: &str = "type_defs.metta";

// =============================================================================
// VERSION DIRECTORY LAYOUT
// =============================================================================

/// Per-partition manifest written after the partition's sessions close.
pub const PARTITION_MANIFEST_FILE: &str = ".partition_manifest.json";

/// Whole-graph metadata of a version.
pub const GRAPH_METADATA_FILE: &str = "graph_info.json";

/// Status artifact of a version.
pub const BUILD_STATUS_FILE: &str = "build_status.json";

/// Scratch area for incremental partial output inside a version directory.
pub const PARTIAL_OUTPUT_DIR: &str = ".partial";

/// Name of the pointer to the newest completed version.
pub const LATEST_POINTER: &str = "latest";

/// Completed versions kept by default.
pub const DEFAULT_RETENTION: usize = 5;

/// Sources built concurrently by default.
pub const DEFAULT_PARALLELISM: usize = 4;
