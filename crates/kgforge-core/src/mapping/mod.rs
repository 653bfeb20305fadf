//! # Identifier Mapping Cache
//!
//! Cross-namespace identifier tables (HGNC symbol to Ensembl id, and the
//! like) consulted by adapters while they build records.
//!
//! ## Refresh and swap
//!
//! A refresh fetches the raw payload, transforms it into a complete new
//! table off to the side, persists it and only then replaces the shared
//! `Arc` in one step. Lookups clone the current `Arc` under a short read lock
//! and never wait for a fetch. A failed refresh leaves the current table in
//! place and reports [`FreshStatus::StaleFallback`]; only a cache with
//! nothing to serve returns an error.

pub mod sources;
pub mod store;

use crate::types::MappingError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

pub use sources::{DelimitedTransform, FileMappingSource};
pub use store::MappingStore;

// =============================================================================
// POLICIES & VERSIONS
// =============================================================================

/// When a mapping refreshes automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Refresh once the table is older than `max_age_hours`.
    FixedInterval { max_age_hours: u64 },
    /// Probe the remote payload's headers and refresh when they change.
    RemoteChange,
    /// Refresh when `artifact` was modified after the last refresh.
    Dependency { artifact: PathBuf },
    /// Refresh only through [`MappingCache::force_refresh`].
    Manual,
}

/// Change markers reported by a header-only probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMarker {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
}

impl RemoteMarker {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none() && self.content_length.is_none()
    }

    /// Compare ETag, then Last-Modified, then Content-Length, using the
    /// first marker both sides carry. `None` when nothing is comparable.
    #[must_use]
    pub fn differs_from(&self, other: &Self) -> Option<bool> {
        if let (Some(a), Some(b)) = (&self.etag, &other.etag) {
            return Some(a != b);
        }
        if let (Some(a), Some(b)) = (&self.last_modified, &other.last_modified) {
            return Some(a != b);
        }
        if let (Some(a), Some(b)) = (self.content_length, other.content_length) {
            return Some(a != b);
        }
        None
    }
}

/// Version record stored with every table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingVersion {
    pub refreshed_at: DateTime<Utc>,
    pub entries: u64,
    /// BLAKE3 digest of the raw payload the table was built from.
    pub fingerprint: String,
    pub remote: Option<RemoteMarker>,
}

/// An immutable key/value table plus its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingTable {
    pub entries: BTreeMap<String, String>,
    pub version: MappingVersion,
}

impl MappingTable {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

/// Outcome of [`MappingCache::ensure_fresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshStatus {
    /// The current table satisfies the policy.
    Fresh,
    /// A new table was fetched and swapped in.
    Refreshed,
    /// A refresh was needed or could not be decided, and the previous table
    /// is still being served.
    StaleFallback,
}

impl FreshStatus {
    #[must_use]
    pub fn is_fresh(self) -> bool {
        matches!(self, Self::Fresh | Self::Refreshed)
    }
}

/// Where a mapping's raw data comes from and how it becomes a table.
pub trait MappingSource: Send + Sync {
    /// Download or read the full payload.
    fn fetch(&self) -> Result<Vec<u8>, MappingError>;

    /// Header-only change probe. `Ok(None)` when the source has no markers.
    fn probe(&self) -> Result<Option<RemoteMarker>, MappingError> {
        Ok(None)
    }

    /// Turn a payload into a key/value table.
    fn transform(&self, payload: &[u8]) -> Result<BTreeMap<String, String>, MappingError>;
}

// =============================================================================
// CACHE
// =============================================================================

/// A persisted, atomically swapped mapping table.
pub struct MappingCache {
    name: String,
    source: Arc<dyn MappingSource>,
    store: MappingStore,
    current: RwLock<Option<Arc<MappingTable>>>,
    /// Serialises refreshes; lookups never take it.
    refresh: Mutex<()>,
}

impl std::fmt::Debug for MappingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingCache")
            .field("name", &self.name)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl MappingCache {
    /// Open the cache stored at `<cache_dir>/<name>.redb` and load any
    /// persisted table.
    pub fn open(
        name: impl Into<String>,
        cache_dir: impl AsRef<Path>,
        source: Arc<dyn MappingSource>,
    ) -> Result<Self, MappingError> {
        let name = name.into();
        let store = MappingStore::open(cache_dir.as_ref().join(format!("{}.redb", name)), &name)?;
        let current = store.load()?.map(Arc::new);
        if let Some(table) = &current {
            tracing::debug!(mapping = %name, entries = table.version.entries, "loaded persisted mapping");
        }
        Ok(Self {
            name,
            source,
            store,
            current: RwLock::new(current),
            refresh: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table currently served.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<MappingTable>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Look up a key in the current table.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.snapshot()
            .and_then(|table| table.get(key).map(str::to_string))
    }

    #[must_use]
    pub fn version(&self) -> Option<MappingVersion> {
        self.snapshot().map(|t| t.version.clone())
    }

    /// Refresh if `policy` says the current table is out of date.
    pub fn ensure_fresh(&self, policy: &RefreshPolicy) -> Result<FreshStatus, MappingError> {
        let _guard = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = self.snapshot() else {
            if *policy == RefreshPolicy::Manual {
                return Err(MappingError::Unavailable(self.name.clone()));
            }
            let marker = self.source.probe().ok().flatten();
            return self.refresh_locked(marker);
        };

        match policy {
            RefreshPolicy::Manual => Ok(FreshStatus::Fresh),
            RefreshPolicy::FixedInterval { max_age_hours } => {
                let max_age = i64::try_from(*max_age_hours)
                    .ok()
                    .and_then(Duration::try_hours)
                    .unwrap_or(Duration::MAX);
                let age = Utc::now().signed_duration_since(current.version.refreshed_at);
                if age > max_age {
                    self.refresh_locked(None)
                } else {
                    Ok(FreshStatus::Fresh)
                }
            }
            RefreshPolicy::RemoteChange => match self.source.probe() {
                Ok(Some(marker)) => match current.version.remote.as_ref() {
                    Some(previous) => match previous.differs_from(&marker) {
                        Some(true) => self.refresh_locked(Some(marker)),
                        Some(false) => Ok(FreshStatus::Fresh),
                        None => {
                            tracing::warn!(mapping = %self.name, "remote markers not comparable");
                            Ok(FreshStatus::StaleFallback)
                        }
                    },
                    None => self.refresh_locked(Some(marker)),
                },
                Ok(None) => {
                    tracing::warn!(mapping = %self.name, "remote probe returned no markers");
                    Ok(FreshStatus::StaleFallback)
                }
                Err(e) => {
                    tracing::warn!(mapping = %self.name, error = %e, "remote probe failed");
                    Ok(FreshStatus::StaleFallback)
                }
            },
            RefreshPolicy::Dependency { artifact } => match modified_at(artifact) {
                Some(modified) if modified > current.version.refreshed_at => {
                    self.refresh_locked(None)
                }
                Some(_) => Ok(FreshStatus::Fresh),
                None => {
                    tracing::debug!(
                        mapping = %self.name,
                        artifact = %artifact.display(),
                        "dependency artifact missing"
                    );
                    Ok(FreshStatus::Fresh)
                }
            },
        }
    }

    /// Refresh regardless of policy.
    pub fn force_refresh(&self) -> Result<FreshStatus, MappingError> {
        let _guard = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        let marker = self.source.probe().ok().flatten();
        self.refresh_locked(marker)
    }

    /// Fetch, transform, persist, swap. Caller holds the refresh lock.
    fn refresh_locked(&self, marker: Option<RemoteMarker>) -> Result<FreshStatus, MappingError> {
        match self.build_table(marker) {
            Ok(table) => {
                let entries = table.version.entries;
                let table = Arc::new(table);
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(table);
                tracing::info!(mapping = %self.name, entries, "mapping refreshed");
                Ok(FreshStatus::Refreshed)
            }
            Err(e) if self.snapshot().is_some() => {
                tracing::warn!(mapping = %self.name, error = %e, "refresh failed, serving cached mapping");
                Ok(FreshStatus::StaleFallback)
            }
            Err(e) => {
                tracing::error!(mapping = %self.name, error = %e, "refresh failed with no cached mapping");
                Err(MappingError::Unavailable(self.name.clone()))
            }
        }
    }

    fn build_table(&self, marker: Option<RemoteMarker>) -> Result<MappingTable, MappingError> {
        let payload = self.source.fetch()?;
        let entries = self.source.transform(&payload)?;
        let table = MappingTable {
            version: MappingVersion {
                refreshed_at: Utc::now(),
                entries: entries.len() as u64,
                fingerprint: blake3::hash(&payload).to_hex().to_string(),
                remote: marker.filter(|m| !m.is_empty()),
            },
            entries,
        };
        self.store.replace(&table)?;
        Ok(table)
    }
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

// =============================================================================
// TESTS
// =============================================================================
