//! # Build Status Artifact
//!
//! `build_status.json` inside each version directory. Rewritten atomically at
//! every state transition so the terminal status and message survive a
//! restart of the process that produced them.

use crate::primitives::BUILD_STATUS_FILE;
use crate::types::KgError;
use crate::writer::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Per-version state machine: `queued -> running -> completed|failed|cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BuildState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Full rebuild or merge against the prior version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    Full,
    Incremental,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        })
    }
}

/// Whether a `running` status is backed by a live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The status is not `running`.
    NotRunning,
    Live,
    /// `running`, but the recorded process is gone; safe to retry.
    Orphaned,
    /// Liveness cannot be determined on this platform.
    Unknown,
}

/// Contents of `build_status.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub status: BuildState,
    pub message: String,
    pub version: String,
    /// Mode actually used; may differ from `requested_mode` after a fallback.
    pub build_mode: BuildMode,
    pub requested_mode: BuildMode,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub log_file: Option<PathBuf>,
    /// Process that last wrote the document.
    pub pid: u32,
}

impl BuildStatus {
    #[must_use]
    pub fn queued(version: &str, mode: BuildMode) -> Self {
        let now = Utc::now();
        Self {
            status: BuildState::Queued,
            message: "build queued".to_string(),
            version: version.to_string(),
            build_mode: mode,
            requested_mode: mode,
            commit: None,
            branch: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            log_file: None,
            pid: std::process::id(),
        }
    }

    /// Move to `next`, stamping timestamps. Illegal transitions are errors.
    pub fn transition(&mut self, next: BuildState, message: impl Into<String>) -> Result<(), KgError> {
        if !self.status.can_transition_to(next) {
            return Err(KgError::BuildError(format!(
                "version {}: illegal transition {} -> {}",
                self.version, self.status, next
            )));
        }
        let now = Utc::now();
        if next == BuildState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        self.message = message.into();
        self.updated_at = now;
        self.pid = std::process::id();
        Ok(())
    }

    #[must_use]
    pub fn path(version_dir: &Path) -> PathBuf {
        version_dir.join(BUILD_STATUS_FILE)
    }

    /// Read the status of a version directory, if it has one.
    pub fn load(version_dir: &Path) -> Result<Option<Self>, KgError> {
        let path = Self::path(version_dir);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|e| KgError::io(path.display(), e))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save(&mut self, version_dir: &Path) -> Result<(), KgError> {
        self.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&Self::path(version_dir), &bytes)
    }

    /// Distinguish a live `running` build from one whose process died.
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        if self.status != BuildState::Running {
            return Liveness::NotRunning;
        }
        if self.pid == std::process::id() {
            return Liveness::Live;
        }
        if cfg!(target_os = "linux") {
            if Path::new("/proc").join(self.pid.to_string()).exists() {
                Liveness::Live
            } else {
                Liveness::Orphaned
            }
        } else {
            Liveness::Unknown
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_lifecycle() {
        let mut status = BuildStatus::queued("v1", BuildMode::Full);
        status.transition(BuildState::Running, "started").expect("run");
        assert!(status.started_at.is_some());
        status.transition(BuildState::Completed, "done").expect("complete");
        assert!(status.finished_at.is_some());
        assert!(status.status.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut status = BuildStatus::queued("v1", BuildMode::Full);
        status.transition(BuildState::Running, "started").expect("run");
        status.transition(BuildState::Cancelled, "stop").expect("cancel");
        assert!(status.transition(BuildState::Completed, "late").is_err());
        assert!(status.transition(BuildState::Running, "again").is_err());
    }

    #[test]
    fn queued_cannot_complete_directly() {
        let mut status = BuildStatus::queued("v1", BuildMode::Full);
        assert!(status.transition(BuildState::Completed, "skip").is_err());
    }

    #[test]
    fn status_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut status = BuildStatus::queued("v1", BuildMode::Incremental);
        status.commit = Some("abc123".into());
        status.save(dir.path()).expect("save");
        let loaded = BuildStatus::load(dir.path()).expect("load").expect("present");
        assert_eq!(loaded.commit.as_deref(), Some("abc123"));
        assert_eq!(loaded.status, BuildState::Queued);

        let raw = std::fs::read_to_string(BuildStatus::path(dir.path())).expect("raw");
        assert!(raw.contains("\"status\": \"queued\""));
        assert!(raw.contains("\"build_mode\": \"incremental\""));
    }

    #[test]
    fn own_running_build_is_live() {
        let mut status = BuildStatus::queued("v1", BuildMode::Full);
        assert_eq!(status.liveness(), Liveness::NotRunning);
        status.transition(BuildState::Running, "started").expect("run");
        assert_eq!(status.liveness(), Liveness::Live);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn running_status_of_dead_process_is_orphaned() {
        let mut status = BuildStatus::queued("v1", BuildMode::Full);
        status.transition(BuildState::Running, "started").expect("run");
        status.pid = u32::MAX;
        assert_eq!(status.liveness(), Liveness::Orphaned);
    }
}
