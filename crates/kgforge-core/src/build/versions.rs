//! # Versions Directory
//!
//! One subdirectory per version id plus a `latest` pointer. The pointer is
//! the only shared mutable reference between builds; it is replaced with a
//! single rename and read only through [`VersionStore::latest`].

use super::status::{BuildState, BuildStatus};
use crate::primitives::LATEST_POINTER;
use crate::types::KgError;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// Summary of one version directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub id: String,
    pub status: BuildState,
    pub created_at: DateTime<Utc>,
}

/// The versions root.
#[derive(Debug, Clone)]
pub struct VersionStore {
    root: PathBuf,
}

impl VersionStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn version_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Fresh, sortable version id such as `v20261019T081500123Z`.
    #[must_use]
    pub fn new_version_id() -> String {
        format!("v{}", Utc::now().format("%Y%m%dT%H%M%S%3fZ"))
    }

    /// Reject ids that would escape the root or shadow the pointer.
    pub fn validate_id(id: &str) -> Result<(), KgError> {
        let valid = !id.is_empty()
            && id != LATEST_POINTER
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(KgError::InvalidConfig(format!("invalid version id '{}'", id)))
        }
    }

    /// Version the `latest` pointer refers to.
    #[must_use]
    pub fn latest(&self) -> Option<String> {
        let pointer = self.root.join(LATEST_POINTER);
        let id = if cfg!(unix) {
            fs::read_link(&pointer)
                .ok()?
                .file_name()?
                .to_string_lossy()
                .into_owned()
        } else {
            fs::read_to_string(&pointer).ok()?.trim().to_string()
        };
        self.version_dir(&id).is_dir().then_some(id)
    }

    /// Point `latest` at `id` with one atomic rename.
    pub fn set_latest(&self, id: &str) -> Result<(), KgError> {
        Self::validate_id(id)?;
        if !self.version_dir(id).is_dir() {
            return Err(KgError::BuildError(format!("version {} does not exist", id)));
        }
        let pointer = self.root.join(LATEST_POINTER);
        let staged = self.root.join(format!(".{}.{}", LATEST_POINTER, id));
        if staged.symlink_metadata().is_ok() {
            fs::remove_file(&staged).map_err(|e| KgError::io(staged.display(), e))?;
        }
        stage_pointer(&staged, id)?;
        fs::rename(&staged, &pointer).map_err(|e| KgError::io(pointer.display(), e))?;
        tracing::info!(version = id, "latest pointer advanced");
        Ok(())
    }

    /// Every version directory carrying a status document, oldest first.
    pub fn list(&self) -> Result<Vec<VersionEntry>, KgError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| KgError::io(self.root.display(), e))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if Self::validate_id(&name).is_err() || !entry.path().is_dir() {
                continue;
            }
            if entry.file_type()?.is_symlink() {
                continue;
            }
            if let Some(status) = BuildStatus::load(&entry.path())? {
                entries.push(VersionEntry {
                    id: name,
                    status: status.status,
                    created_at: status.created_at,
                });
            }
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Keep the newest `retention` completed versions and delete older ones.
    ///
    /// The `latest` target is never deleted. Failed and cancelled versions
    /// older than the oldest kept completed version go too; queued and
    /// running versions are left alone. Returns the deleted ids.
    pub fn prune(&self, retention: usize) -> Result<Vec<String>, KgError> {
        let entries = self.list()?;
        let latest = self.latest();
        let completed: Vec<&VersionEntry> = entries
            .iter()
            .filter(|e| e.status == BuildState::Completed)
            .collect();
        let excess = completed.len().saturating_sub(retention.max(1));
        let mut doomed: Vec<&VersionEntry> = completed.into_iter().take(excess).collect();
        let oldest_kept = entries
            .iter()
            .filter(|e| e.status == BuildState::Completed)
            .nth(excess)
            .map(|e| e.created_at);
        if let Some(oldest_kept) = oldest_kept {
            doomed.extend(entries.iter().filter(|e| {
                matches!(e.status, BuildState::Failed | BuildState::Cancelled)
                    && e.created_at < oldest_kept
            }));
        }

        let mut removed = Vec::new();
        for entry in doomed {
            if latest.as_deref() == Some(entry.id.as_str()) {
                continue;
            }
            let dir = self.version_dir(&entry.id);
            fs::remove_dir_all(&dir).map_err(|e| KgError::io(dir.display(), e))?;
            tracing::info!(version = %entry.id, status = %entry.status, "pruned version");
            removed.push(entry.id.clone());
        }
        Ok(removed)
    }
}

#[cfg(unix)]
fn stage_pointer(staged: &Path, id: &str) -> Result<(), KgError> {
    std::os::unix::fs::symlink(id, staged).map_err(|e| KgError::io(staged.display(), e))
}

#[cfg(not(unix))]
fn stage_pointer(staged: &Path, id: &str) -> Result<(), KgError> {
    fs::write(staged, id).map_err(|e| KgError::io(staged.display(), e))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::status::BuildMode;

    fn make_version(store: &VersionStore, id: &str, state: BuildState, age_secs: i64) {
        let dir = store.version_dir(id);
        fs::create_dir_all(&dir).expect("dir");
        let mut status = BuildStatus::queued(id, BuildMode::Full);
        status.status = state;
        status.created_at = Utc::now() - chrono::Duration::seconds(age_secs);
        status.save(&dir).expect("save");
    }

    #[test]
    fn latest_is_absent_until_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionStore::new(dir.path());
        assert_eq!(store.latest(), None);
        make_version(&store, "v1", BuildState::Completed, 10);
        store.set_latest("v1").expect("set");
        assert_eq!(store.latest().as_deref(), Some("v1"));
        make_version(&store, "v2", BuildState::Completed, 5);
        store.set_latest("v2").expect("swap");
        assert_eq!(store.latest().as_deref(), Some("v2"));
    }

    #[test]
    fn pointer_to_missing_version_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionStore::new(dir.path());
        assert!(store.set_latest("v9").is_err());
        assert!(store.set_latest("../etc").is_err());
    }

    #[test]
    fn prune_keeps_newest_completed_and_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionStore::new(dir.path());
        make_version(&store, "v1", BuildState::Completed, 50);
        make_version(&store, "v2", BuildState::Failed, 40);
        make_version(&store, "v3", BuildState::Completed, 30);
        make_version(&store, "v4", BuildState::Completed, 20);
        make_version(&store, "v5", BuildState::Running, 10);
        store.set_latest("v1").expect("latest");

        let removed = store.prune(1).expect("prune");
        assert_eq!(removed, vec!["v3".to_string(), "v2".to_string()]);
        let remaining: Vec<String> = store.list().expect("list").into_iter().map(|e| e.id).collect();
        assert_eq!(remaining, ["v1", "v4", "v5"]);
    }

    #[test]
    fn list_ignores_pointer_and_scratch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionStore::new(dir.path());
        make_version(&store, "v1", BuildState::Completed, 1);
        store.set_latest("v1").expect("latest");
        fs::create_dir_all(dir.path().join(".scratch")).expect("scratch");
        let ids: Vec<String> = store.list().expect("list").into_iter().map(|e| e.id).collect();
        assert_eq!(ids, ["v1"]);
    }
}
