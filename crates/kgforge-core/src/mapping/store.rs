//! # redb-backed Mapping Store
//!
//! Persists one mapping table and its version record so a cache survives
//! restarts. A refresh replaces both inside a single write transaction:
//! a crash mid-refresh leaves the previous table intact.

use super::{MappingTable, MappingVersion};
use crate::types::MappingError;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;

/// Table for entries: key -> value
const ENTRIES: TableDefinition<&str, &str> = TableDefinition::new("entries");

/// Table for metadata: "version" -> postcard-encoded `MappingVersion`
const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");

const VERSION_KEY: &str = "version";

/// On-disk store for one mapping.
pub struct MappingStore {
    db: Database,
    name: String,
}

impl std::fmt::Debug for MappingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingStore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MappingStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>, name: &str) -> Result<Self, MappingError> {
        let err = |e: &dyn std::fmt::Display| MappingError::Store {
            name: name.to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| err(&e))?;
        }
        let db = Database::create(path.as_ref()).map_err(|e| err(&e))?;

        // Initialize tables if they don't exist
        let write_txn = db.begin_write().map_err(|e| err(&e))?;
        {
            let _ = write_txn.open_table(ENTRIES).map_err(|e| err(&e))?;
            let _ = write_txn.open_table(METADATA).map_err(|e| err(&e))?;
        }
        write_txn.commit().map_err(|e| err(&e))?;

        Ok(Self {
            db,
            name: name.to_string(),
        })
    }

    fn err(&self, e: impl std::fmt::Display) -> MappingError {
        MappingError::Store {
            name: self.name.clone(),
            reason: e.to_string(),
        }
    }

    /// Load the persisted table, if a refresh ever completed.
    pub fn load(&self) -> Result<Option<MappingTable>, MappingError> {
        let read_txn = self.db.begin_read().map_err(|e| self.err(e))?;

        let version = {
            let table = read_txn.open_table(METADATA).map_err(|e| self.err(e))?;
            match table.get(VERSION_KEY).map_err(|e| self.err(e))? {
                Some(bytes) => postcard::from_bytes::<MappingVersion>(bytes.value())
                    .map_err(|e| self.err(e))?,
                None => return Ok(None),
            }
        };

        let table = read_txn.open_table(ENTRIES).map_err(|e| self.err(e))?;
        let mut entries = BTreeMap::new();
        for entry in table.iter().map_err(|e| self.err(e))? {
            let (key, value) = entry.map_err(|e| self.err(e))?;
            entries.insert(key.value().to_string(), value.value().to_string());
        }
        Ok(Some(MappingTable { entries, version }))
    }

    /// Replace the persisted table and version in one transaction.
    pub fn replace(&self, table: &MappingTable) -> Result<(), MappingError> {
        let version = postcard::to_allocvec(&table.version).map_err(|e| self.err(e))?;
        let write_txn = self.db.begin_write().map_err(|e| self.err(e))?;
        {
            write_txn.delete_table(ENTRIES).map_err(|e| self.err(e))?;
            let mut entries = write_txn.open_table(ENTRIES).map_err(|e| self.err(e))?;
            for (key, value) in &table.entries {
                entries
                    .insert(key.as_str(), value.as_str())
                    .map_err(|e| self.err(e))?;
            }
            let mut metadata = write_txn.open_table(METADATA).map_err(|e| self.err(e))?;
            metadata
                .insert(VERSION_KEY, version.as_slice())
                .map_err(|e| self.err(e))?;
        }
        write_txn.commit().map_err(|e| self.err(e))?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn table(pairs: &[(&str, &str)]) -> MappingTable {
        MappingTable {
            entries: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            version: MappingVersion {
                refreshed_at: Utc::now(),
                entries: pairs.len() as u64,
                fingerprint: "abc".into(),
                remote: None,
            },
        }
    }

    #[test]
    fn empty_store_loads_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MappingStore::open(dir.path().join("hgnc.redb"), "hgnc").expect("open");
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn replace_drops_old_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hgnc.redb");
        {
            let store = MappingStore::open(&path, "hgnc").expect("open");
            store
                .replace(&table(&[("a", "1"), ("b", "2")]))
                .expect("first");
            store.replace(&table(&[("c", "3")])).expect("second");
        }
        let store = MappingStore::open(&path, "hgnc").expect("reopen");
        let loaded = store.load().expect("load").expect("table");
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries["c"], "3");
        assert_eq!(loaded.version.entries, 1);
    }
}
