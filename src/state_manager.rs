use crate::state::AssessmentState;
use crate::util::{ensure_dir, sha256_hex};
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Expected failure modes of checkpoint persistence. Callers match on these
/// instead of wrapping the whole API in a catch-all.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("no saved state for session {0}")]
    NotFound(String),
    #[error("state for session {session_id} failed integrity checks: {reason}")]
    Corrupted { session_id: String, reason: String },
    #[error("state I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One row of `list_sessions`: enough to pick a session without loading or
/// structurally validating its full state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: String,
    pub total_documents: usize,
    pub completed_documents: usize,
    pub modified: String,
}

/// Durable, verifiable persistence of [`AssessmentState`] snapshots.
///
/// The state file plus its checksum companion is the single arbiter of
/// session state. Saves go through a temp file and rename so a crash
/// mid-write can never leave a half-written checkpoint that passes as valid.
pub struct StateManager {
    state_dir: PathBuf,
}

impl StateManager {
    /// Fails only when the state directory cannot be created; everything
    /// after construction reports expected failures as [`StateError`].
    pub fn new(state_dir: &Path) -> Result<Self> {
        ensure_dir(state_dir)?;
        ensure_dir(&state_dir.join("backups"))?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
        })
    }

    pub fn state_path(&self, session_id: &str) -> PathBuf {
        self.state_dir.join(format!("state_{session_id}.json"))
    }

    fn checksum_path(&self, session_id: &str) -> PathBuf {
        self.state_dir.join(format!("state_{session_id}.checksum"))
    }

    pub fn progress_path(&self, session_id: &str) -> PathBuf {
        self.state_dir.join(format!("progress_{session_id}.json"))
    }

    fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    /// Persist the full snapshot. Touches `updated_at`, backs up any existing
    /// file for this session, then writes state and checksum.
    pub fn save_state(&self, state: &mut AssessmentState) -> Result<(), StateError> {
        self.save_state_with_backup(state, true)
    }

    pub fn save_state_with_backup(
        &self,
        state: &mut AssessmentState,
        backup: bool,
    ) -> Result<(), StateError> {
        state.updated_at = OffsetDateTime::now_utc();

        let path = self.state_path(&state.session_id);
        if backup && path.exists() {
            if let Err(e) = self.backup_existing(&state.session_id) {
                warn!("backup of previous state failed: {e}");
            }
        }

        let bytes = serde_json::to_vec_pretty(state)?;

        // Full serialization lands in a temp sibling first; the rename is
        // what makes the new snapshot visible.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;
        std::fs::write(self.checksum_path(&state.session_id), sha256_hex(&bytes))?;

        debug!(session_id = %state.session_id, bytes = bytes.len(), "state saved");
        Ok(())
    }

    fn backup_existing(&self, session_id: &str) -> Result<(), StateError> {
        let src = self.state_path(session_id);
        let stamp = OffsetDateTime::now_utc().unix_timestamp();
        let dst = self
            .backups_dir()
            .join(format!("state_{session_id}_{stamp}.json"));
        std::fs::copy(&src, &dst)?;
        Ok(())
    }

    /// Load the snapshot for `session_id`. With `validate`, the stored
    /// checksum must match a recomputation over the file bytes; a mismatch or
    /// unparseable file falls back to the newest backup before giving up.
    pub fn load_state(
        &self,
        session_id: &str,
        validate: bool,
    ) -> Result<AssessmentState, StateError> {
        let path = self.state_path(session_id);
        if !path.exists() {
            return Err(StateError::NotFound(session_id.to_string()));
        }

        let bytes = std::fs::read(&path)?;

        if validate {
            let recorded = std::fs::read_to_string(self.checksum_path(session_id))
                .map(|s| s.trim().to_string())
                .ok();
            let actual = sha256_hex(&bytes);
            if let Some(recorded) = recorded {
                if recorded != actual {
                    warn!(session_id, "checksum mismatch; trying backups");
                    return self.recover_from_backup(session_id).ok_or_else(|| {
                        StateError::Corrupted {
                            session_id: session_id.to_string(),
                            reason: "checksum mismatch and no usable backup".into(),
                        }
                    });
                }
            } else {
                warn!(session_id, "checksum file missing; integrity not verifiable");
            }
        }

        match serde_json::from_slice::<AssessmentState>(&bytes) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(session_id, "state unparseable ({e}); trying backups");
                self.recover_from_backup(session_id)
                    .ok_or_else(|| StateError::Corrupted {
                        session_id: session_id.to_string(),
                        reason: format!("unparseable state and no usable backup: {e}"),
                    })
            }
        }
    }

    /// Newest-first walk of this session's backups; the first one that
    /// parses wins and is re-saved as the current state.
    fn recover_from_backup(&self, session_id: &str) -> Option<AssessmentState> {
        let prefix = format!("state_{session_id}_");
        let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let entries = std::fs::read_dir(self.backups_dir()).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                if let Ok(meta) = entry.metadata() {
                    if let Ok(modified) = meta.modified() {
                        candidates.push((modified, entry.path()));
                    }
                }
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, path) in candidates {
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            if let Ok(mut state) = serde_json::from_slice::<AssessmentState>(&bytes) {
                info!(session_id, backup = %path.display(), "recovered state from backup");
                if let Err(e) = self.save_state_with_backup(&mut state, false) {
                    warn!("re-saving recovered state failed: {e}");
                }
                return Some(state);
            }
        }
        None
    }

    /// Structural checks on a loaded state. Accumulates every issue instead
    /// of stopping at the first; the state is valid iff the list is empty.
    pub fn validate_state(&self, state: &AssessmentState) -> Vec<String> {
        let mut issues = Vec::new();

        if state.session_id.is_empty() {
            issues.push("session id is empty".to_string());
        }
        issues.extend(state.config.section_issues());
        if state.batches.is_empty() {
            issues.push("state has no batches".to_string());
        }

        for batch in &state.batches {
            if batch.id.is_empty() {
                issues.push("batch with empty id".to_string());
            }
            if batch.documents.is_empty() {
                issues.push(format!("batch {} has no documents", batch.id));
            }
            for doc in &batch.documents {
                if doc.status == crate::state::DocumentStatus::Completed
                    && doc.result_file.is_none()
                {
                    issues.push(format!(
                        "batch {}: completed document {} has no result file",
                        batch.id,
                        doc.path.display()
                    ));
                }
            }
        }

        let recomputed: usize = state.batches.iter().map(|b| b.documents.len()).sum();
        if recomputed != state.total_documents {
            issues.push(format!(
                "total_documents mismatch: stored {} but batches hold {}",
                state.total_documents, recomputed
            ));
        }

        if !state.work_dir.exists() {
            issues.push(format!("work dir missing: {}", state.work_dir.display()));
        }
        if !state.output_dir.exists() {
            issues.push(format!("output dir missing: {}", state.output_dir.display()));
        }

        issues
    }

    /// Enumerate persisted sessions newest-first. Corrupted files become
    /// `status = "corrupted"` rows rather than failing the listing.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, StateError> {
        let pattern = regex::Regex::new(r"^state_(.+)\.json$").expect("static regex");
        let mut rows: Vec<(std::time::SystemTime, SessionSummary)> = Vec::new();

        for entry in std::fs::read_dir(&self.state_dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(caps) = pattern.captures(&name) else {
                continue;
            };
            let session_id = caps[1].to_string();
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            let modified_str = OffsetDateTime::from(modified)
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "unknown".into());

            let summary = match std::fs::read(entry.path())
                .ok()
                .and_then(|b| serde_json::from_slice::<AssessmentState>(&b).ok())
            {
                Some(state) => SessionSummary {
                    session_id,
                    status: format!("{:?}", state.status).to_lowercase(),
                    total_documents: state.total_documents,
                    completed_documents: state.completed_documents,
                    modified: modified_str,
                },
                None => SessionSummary {
                    session_id,
                    status: "corrupted".into(),
                    total_documents: 0,
                    completed_documents: 0,
                    modified: modified_str,
                },
            };
            rows.push((modified, summary));
        }

        rows.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(rows.into_iter().map(|(_, s)| s).collect())
    }

    pub fn delete_state(&self, session_id: &str, create_backup: bool) -> Result<(), StateError> {
        let path = self.state_path(session_id);
        if !path.exists() {
            return Err(StateError::NotFound(session_id.to_string()));
        }
        if create_backup {
            self.backup_existing(session_id)?;
        }
        std::fs::remove_file(&path)?;
        let checksum = self.checksum_path(session_id);
        if checksum.exists() {
            std::fs::remove_file(checksum)?;
        }
        let progress = self.progress_path(session_id);
        if progress.exists() {
            let _ = std::fs::remove_file(progress);
        }
        info!(session_id, "state deleted");
        Ok(())
    }

    /// Remove state files older than `max_age_days`. Backups survive unless
    /// `keep_backups` is false. Returns how many sessions were removed.
    pub fn cleanup_old_states(
        &self,
        max_age_days: u64,
        keep_backups: bool,
    ) -> Result<usize, StateError> {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(max_age_days * 24 * 60 * 60);
        let mut removed = 0usize;

        for summary in self.list_sessions()? {
            let path = self.state_path(&summary.session_id);
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified < cutoff {
                self.delete_state(&summary.session_id, keep_backups)?;
                removed += 1;
            }
        }

        if !keep_backups {
            for entry in std::fs::read_dir(self.backups_dir())?.flatten() {
                let old = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|m| m < cutoff)
                    .unwrap_or(false);
                if old {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        Ok(removed)
    }
}
