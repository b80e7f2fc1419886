use crate::util::now_rfc3339;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Memory,
    File,
    Api,
    Format,
    Unknown,
}

impl ErrorCategory {
    /// A caller-supplied type name beats substring guessing when present.
    fn from_hint(hint: &str) -> Option<Self> {
        match hint.to_ascii_lowercase().as_str() {
            "network" => Some(Self::Network),
            "timeout" => Some(Self::Timeout),
            "memory" => Some(Self::Memory),
            "file" => Some(Self::File),
            "api" => Some(Self::Api),
            "format" => Some(Self::Format),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Critical,
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedError {
    pub batch_id: String,
    pub document: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub at: String,
}

/// Classifies reported errors by substring so the caller can spot systemic
/// problems (every batch timing out, the API key dead) without parsing
/// worker logs.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    errors: Vec<TrackedError>,
}

impl ErrorTracker {
    pub fn record(
        &mut self,
        batch_id: &str,
        document: &str,
        message: &str,
        type_hint: Option<&str>,
    ) {
        let category = type_hint
            .and_then(ErrorCategory::from_hint)
            .unwrap_or_else(|| Self::classify(message));
        let severity = Self::severity(message);
        self.errors.push(TrackedError {
            batch_id: batch_id.to_string(),
            document: document.to_string(),
            message: message.to_string(),
            category,
            severity,
            at: now_rfc3339(),
        });
    }

    fn classify(message: &str) -> ErrorCategory {
        let m = message.to_ascii_lowercase();
        if m.contains("timeout") || m.contains("timed out") {
            ErrorCategory::Timeout
        } else if m.contains("connection") || m.contains("network") || m.contains("dns") {
            ErrorCategory::Network
        } else if m.contains("memory") || m.contains("oom") {
            ErrorCategory::Memory
        } else if m.contains("no such file") || m.contains("permission") || m.contains("not found")
        {
            ErrorCategory::File
        } else if m.contains("api") || m.contains("rate limit") || m.contains("quota") {
            ErrorCategory::Api
        } else if m.contains("parse") || m.contains("json") || m.contains("format") {
            ErrorCategory::Format
        } else {
            ErrorCategory::Unknown
        }
    }

    fn severity(message: &str) -> ErrorSeverity {
        let m = message.to_ascii_lowercase();
        if m.contains("critical") || m.contains("fatal") || m.contains("oom") || m.contains("quota")
        {
            ErrorSeverity::Critical
        } else if m.contains("warning") || m.contains("skipped") {
            ErrorSeverity::Warning
        } else {
            ErrorSeverity::Error
        }
    }

    pub fn summary(&self) -> BTreeMap<ErrorCategory, usize> {
        let mut counts = BTreeMap::new();
        for e in &self.errors {
            *counts.entry(e.category).or_insert(0) += 1;
        }
        counts
    }

    pub fn critical_errors(&self) -> Vec<&TrackedError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ErrorSeverity::Critical)
            .collect()
    }

    pub fn all(&self) -> &[TrackedError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub total_documents: usize,
    pub completed_documents: usize,
    pub failed_documents: usize,
    pub total_processing_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct ProgressSnapshot {
    pub session_id: String,
    pub generated_at: String,
    pub elapsed_seconds: f64,
    pub total_documents: usize,
    pub completed_documents: usize,
    pub failed_documents: usize,
    pub throughput_docs_per_minute: Option<f64>,
    pub eta_seconds: Option<f64>,
    pub batches: Vec<BatchProgress>,
    pub error_counts: BTreeMap<ErrorCategory, usize>,
    pub critical_error_count: usize,
}

struct MonitorShared {
    session_id: String,
    started: Instant,
    batches: BTreeMap<String, BatchProgress>,
    errors: ErrorTracker,
}

/// Near-real-time visibility into a running session, decoupled from the
/// authoritative checkpoint. The background thread only reads the shared
/// counters and writes an advisory snapshot file; losing a tick loses
/// nothing but display freshness.
pub struct ProgressMonitor {
    shared: Arc<Mutex<MonitorShared>>,
    interval: Duration,
    snapshot_path: PathBuf,
    stopper: Option<(mpsc::Sender<()>, std::thread::JoinHandle<()>)>,
}

impl ProgressMonitor {
    pub fn new(session_id: &str, snapshot_path: PathBuf, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(MonitorShared {
                session_id: session_id.to_string(),
                started: Instant::now(),
                batches: BTreeMap::new(),
                errors: ErrorTracker::default(),
            })),
            interval,
            snapshot_path,
            stopper: None,
        }
    }

    pub fn register_batch(&self, batch_id: &str, total_documents: usize) {
        let mut shared = self.shared.lock().expect("monitor lock");
        shared
            .batches
            .entry(batch_id.to_string())
            .or_insert_with(|| BatchProgress {
                batch_id: batch_id.to_string(),
                total_documents,
                completed_documents: 0,
                failed_documents: 0,
                total_processing_seconds: 0.0,
            });
    }

    /// The single mutation entry point. An error routes the document to the
    /// failure counter and the tracker; otherwise it counts as completed.
    pub fn update_batch_progress(
        &self,
        batch_id: &str,
        document: &str,
        processing_time: Option<f64>,
        error: Option<&str>,
        error_type: Option<&str>,
    ) {
        let mut shared = self.shared.lock().expect("monitor lock");
        match error {
            Some(message) => {
                shared.errors.record(batch_id, document, message, error_type);
                if let Some(batch) = shared.batches.get_mut(batch_id) {
                    batch.failed_documents += 1;
                }
            }
            None => {
                if let Some(batch) = shared.batches.get_mut(batch_id) {
                    batch.completed_documents += 1;
                    if let Some(secs) = processing_time {
                        batch.total_processing_seconds += secs;
                    }
                }
            }
        }
    }

    /// Linear extrapolation from observed throughput. `None` when there is
    /// nothing to extrapolate from yet.
    pub fn calculate_eta(completed: usize, total: usize, elapsed_seconds: f64) -> Option<f64> {
        if total == 0 || completed == 0 || elapsed_seconds <= 0.0 {
            return None;
        }
        if completed >= total {
            return Some(0.0);
        }
        let rate = completed as f64 / elapsed_seconds;
        if rate <= 0.0 {
            return None;
        }
        Some((total - completed) as f64 / rate)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        build_snapshot(&self.shared.lock().expect("monitor lock"))
    }

    pub fn has_critical_errors(&self) -> bool {
        let shared = self.shared.lock().expect("monitor lock");
        !shared.errors.critical_errors().is_empty()
    }

    /// Start the background tick thread. The stop channel's `recv_timeout`
    /// is both the sleep and the cancellation check; the thread is never
    /// killed, only asked to return.
    pub fn start_monitoring(&mut self) {
        if self.stopper.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let snapshot_path = self.snapshot_path.clone();

        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    tick(&shared, &snapshot_path);
                }
                _ => break,
            }
        });

        self.stopper = Some((tx, handle));
        debug!(interval_secs = self.interval.as_secs(), "progress monitor started");
    }

    pub fn stop_monitoring(&mut self) {
        if let Some((tx, handle)) = self.stopper.take() {
            let _ = tx.send(());
            if handle.join().is_err() {
                warn!("progress monitor thread panicked");
            }
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

fn build_snapshot(shared: &MonitorShared) -> ProgressSnapshot {
    let elapsed = shared.started.elapsed().as_secs_f64();
    let total: usize = shared.batches.values().map(|b| b.total_documents).sum();
    let completed: usize = shared.batches.values().map(|b| b.completed_documents).sum();
    let failed: usize = shared.batches.values().map(|b| b.failed_documents).sum();

    ProgressSnapshot {
        session_id: shared.session_id.clone(),
        generated_at: now_rfc3339(),
        elapsed_seconds: elapsed,
        total_documents: total,
        completed_documents: completed,
        failed_documents: failed,
        throughput_docs_per_minute: if elapsed > 0.0 && completed > 0 {
            Some(completed as f64 / elapsed * 60.0)
        } else {
            None
        },
        eta_seconds: ProgressMonitor::calculate_eta(completed, total, elapsed),
        batches: shared.batches.values().cloned().collect(),
        error_counts: shared.errors.summary(),
        critical_error_count: shared.errors.critical_errors().len(),
    }
}

fn tick(shared: &Arc<Mutex<MonitorShared>>, snapshot_path: &std::path::Path) {
    let snapshot = build_snapshot(&shared.lock().expect("monitor lock"));

    info!(
        completed = snapshot.completed_documents,
        failed = snapshot.failed_documents,
        total = snapshot.total_documents,
        eta_seconds = snapshot.eta_seconds,
        "progress"
    );

    // Advisory only; a failed write must not disturb the session.
    match serde_json::to_vec_pretty(&snapshot) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(snapshot_path, bytes) {
                debug!("progress snapshot write failed: {e}");
            }
        }
        Err(e) => debug!("progress snapshot serialize failed: {e}"),
    }
}
