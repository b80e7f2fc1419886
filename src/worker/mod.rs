pub mod process;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use process::ProcessSpawner;

/// Everything a worker launch needs, resolved ahead of time by the manager.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub batch_id: String,
    pub python_exe: String,
    pub worker_script: PathBuf,
    pub config_file: PathBuf,
    pub output_dir: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
}

/// Seam between the batch manager and the OS. The production implementation
/// spawns real subprocesses; tests substitute a recording fake.
pub trait WorkerSpawner {
    /// Launch one worker for one batch and return its PID. The caller does
    /// not wait for completion; results files are the completion signal.
    fn spawn(&self, req: &SpawnRequest) -> Result<u32>;

    /// Graceful-then-forceful termination: SIGTERM, wait up to `grace`,
    /// SIGKILL whatever is left. Returns true when escalation was needed.
    fn terminate(&self, pid: u32, grace: Duration) -> Result<bool>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// The batch-scoped configuration serialized to `{batch_id}_config.json` and
/// handed to the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchWorkerConfig {
    pub batch_id: String,
    pub documents: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub llm_models: crate::config::LlmModels,
    pub processing: crate::config::Processing,
}

/// Wire format of `{batch_id}_results.json`, produced by the worker. The
/// manager compares the entry count against the batch's document count to
/// infer completion; it does not inspect assessment payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResults {
    pub batch_id: String,
    #[serde(default)]
    pub results: Vec<DocumentResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResult {
    pub document: PathBuf,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub processing_seconds: Option<f64>,
    #[serde(default)]
    pub assessment: Option<serde_json::Value>,
}

impl DocumentResult {
    pub fn is_completed(&self) -> bool {
        self.status == "completed" || self.status == "skipped"
    }

    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }
}
