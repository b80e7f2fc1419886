use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

/// Processing status of one input file within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentState {
    pub path: PathBuf,
    pub status: DocumentStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub result_file: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub content_checksum: Option<String>,
}

impl DocumentState {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            status: DocumentStatus::Pending,
            started_at: None,
            finished_at: None,
            result_file: None,
            error: None,
            retry_count: 0,
            content_checksum: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.status,
            DocumentStatus::Completed | DocumentStatus::Failed | DocumentStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Paused,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::CompletedWithErrors | BatchStatus::Failed
        )
    }
}

/// A fixed partition of documents assigned to one worker subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub id: String,
    pub status: BatchStatus,
    pub documents: Vec<DocumentState>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    /// Derived, 0-100. Recomputed by `update_progress`, never authoritative.
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub worker_pid: Option<u32>,
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub error: Option<String>,
}

impl BatchState {
    pub fn new(id: String, documents: Vec<DocumentState>, output_dir: PathBuf) -> Self {
        Self {
            id,
            status: BatchStatus::Pending,
            documents,
            started_at: None,
            finished_at: None,
            progress: 0,
            worker_pid: None,
            config_file: None,
            output_dir,
            error: None,
        }
    }

    pub fn completed_documents(&self) -> Vec<&DocumentState> {
        self.documents
            .iter()
            .filter(|d| {
                matches!(d.status, DocumentStatus::Completed | DocumentStatus::Skipped)
            })
            .collect()
    }

    pub fn failed_documents(&self) -> Vec<&DocumentState> {
        self.documents
            .iter()
            .filter(|d| d.status == DocumentStatus::Failed)
            .collect()
    }

    /// progress = round(100 * |completed or skipped| / |documents|).
    pub fn update_progress(&mut self) {
        let total = self.documents.len();
        if total == 0 {
            self.progress = 0;
            return;
        }
        let done = self.completed_documents().len();
        self.progress = ((done as f64 / total as f64) * 100.0).round() as u8;
    }

    /// A batch is complete iff every document is completed or skipped.
    pub fn is_complete(&self) -> bool {
        !self.documents.is_empty() && self.documents.iter().all(|d| {
            matches!(d.status, DocumentStatus::Completed | DocumentStatus::Skipped)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Top-level session snapshot. The persisted form of this struct is the
/// checkpoint; the config snapshot rides along so resume never depends on
/// external config mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentState {
    pub session_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub status: SessionStatus,
    pub config: Config,
    pub batches: Vec<BatchState>,
    #[serde(default)]
    pub total_documents: usize,
    #[serde(default)]
    pub completed_documents: usize,
    #[serde(default)]
    pub failed_documents: usize,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub cost_tracking: BTreeMap<String, f64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AssessmentState {
    pub fn new(session_id: String, config: Config, work_dir: PathBuf, output_dir: PathBuf) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            session_id,
            created_at: now,
            updated_at: now,
            status: SessionStatus::Initializing,
            config,
            batches: Vec::new(),
            total_documents: 0,
            completed_documents: 0,
            failed_documents: 0,
            work_dir,
            output_dir,
            cost_tracking: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Recompute the aggregate counters from the batches. Counters are never
    /// maintained incrementally; recomputation is what keeps them from
    /// drifting.
    pub fn update_counters(&mut self) {
        self.total_documents = self.batches.iter().map(|b| b.documents.len()).sum();
        self.completed_documents = self
            .batches
            .iter()
            .map(|b| b.completed_documents().len())
            .sum();
        self.failed_documents = self.batches.iter().map(|b| b.failed_documents().len()).sum();
    }

    pub fn all_batches_terminal(&self) -> bool {
        !self.batches.is_empty() && self.batches.iter().all(|b| b.status.is_terminal())
    }

    pub fn remaining_documents(&self) -> usize {
        self.total_documents
            .saturating_sub(self.completed_documents)
    }
}
