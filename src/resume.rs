use crate::{
    manager::{collect_documents, read_pid_file, AssessmentManager},
    state::AssessmentState,
    util::elapsed_seconds,
    worker::WorkerSpawner,
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{info, warn};

/// What a resume would do, computed without touching any process.
#[derive(Debug, Serialize)]
pub struct ResumePreview {
    pub session_id: String,
    pub can_resume: bool,
    pub issues: Vec<String>,
    pub total_documents: usize,
    pub completed_documents: usize,
    pub remaining_documents: usize,
    pub batches_to_restart: usize,
    pub estimated_remaining_seconds: Option<f64>,
}

/// Safety facade over the manager: a resume is previewed, its issues are
/// surfaced, and nothing restarts while issues exist unless forced.
pub struct ResumeManager<'a, W: WorkerSpawner> {
    manager: &'a mut AssessmentManager<W>,
}

impl<'a, W: WorkerSpawner> ResumeManager<'a, W> {
    pub fn new(manager: &'a mut AssessmentManager<W>) -> Self {
        Self { manager }
    }

    pub fn preview(&self, session_id: &str) -> Result<ResumePreview> {
        let state = self
            .manager
            .state_manager()
            .load_state(session_id, true)
            .with_context(|| format!("loading state for session {session_id}"))?;

        let issues = self.check_resume_issues(&state);
        let batches_to_restart = state
            .batches
            .iter()
            .filter(|b| !b.status.is_terminal())
            .count();

        Ok(ResumePreview {
            session_id: session_id.to_string(),
            can_resume: issues.is_empty(),
            issues,
            total_documents: state.total_documents,
            completed_documents: state.completed_documents,
            remaining_documents: state.remaining_documents(),
            batches_to_restart,
            estimated_remaining_seconds: estimate_remaining_seconds(&state),
        })
    }

    /// Refuses while issues exist unless `force`; the caller always sees the
    /// issue list either way.
    pub fn resume(&mut self, session_id: &str, force: bool) -> Result<AssessmentState> {
        let preview = self.preview(session_id)?;
        if !preview.can_resume {
            if !force {
                bail!(
                    "refusing to resume session {session_id}: {}",
                    preview.issues.join("; ")
                );
            }
            for issue in &preview.issues {
                warn!("forced resume past issue: {issue}");
            }
        }

        info!(
            session_id,
            remaining = preview.remaining_documents,
            batches = preview.batches_to_restart,
            "resuming session"
        );
        self.manager.resume_assessment(session_id)
    }

    /// Conditions that make a blind resume unsafe. None are auto-resolved.
    fn check_resume_issues(&self, state: &AssessmentState) -> Vec<String> {
        let mut issues = Vec::new();

        if !state.work_dir.exists() {
            issues.push(format!("work dir missing: {}", state.work_dir.display()));
        }
        if !state.output_dir.exists() {
            issues.push(format!("output dir missing: {}", state.output_dir.display()));
        }
        issues.extend(state.config.section_issues());

        let input_folder = Path::new(&state.config.paths.input_folder);
        if !input_folder.is_dir() {
            issues.push(format!(
                "input folder missing: {}",
                input_folder.display()
            ));
        } else {
            // Batch membership is positional: a changed input set silently
            // misaligns the checkpoint's batch definitions with a rescan.
            let exts: BTreeSet<String> = state
                .config
                .processing
                .supported_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect();
            let mut found = BTreeSet::new();
            if collect_documents(input_folder, &exts, &mut found).is_ok()
                && found.len() != state.total_documents
            {
                issues.push(format!(
                    "input folder now holds {} documents but the checkpoint recorded {}",
                    found.len(),
                    state.total_documents
                ));
            }
        }

        for batch in &state.batches {
            if batch.documents.is_empty() {
                issues.push(format!("batch {} has zero documents", batch.id));
            }
            if batch.status.is_terminal() {
                continue;
            }
            // A stale PID file whose process still answers the liveness
            // probe means a worker from the previous run may still be
            // writing into this batch's output.
            if let Some(pid) = read_pid_file(&state.work_dir, &batch.id) {
                if self.manager.spawner().is_alive(pid) {
                    issues.push(format!(
                        "batch {}: pid file points at live process {pid}; \
                         a worker may still be running",
                        batch.id
                    ));
                }
            }
        }

        issues
    }
}

/// Remaining-time estimate from completed batches' actual elapsed/document
/// ratios. Only batches with both timestamps contribute; with no finished
/// batch there is nothing to extrapolate from.
fn estimate_remaining_seconds(state: &AssessmentState) -> Option<f64> {
    let mut elapsed_total = 0.0f64;
    let mut docs_total = 0usize;

    for batch in &state.batches {
        if !batch.status.is_terminal() {
            continue;
        }
        let (Some(started), Some(finished)) = (batch.started_at, batch.finished_at) else {
            continue;
        };
        let done = batch.completed_documents().len();
        if done == 0 {
            continue;
        }
        elapsed_total += elapsed_seconds(started, finished);
        docs_total += done;
    }

    if docs_total == 0 || elapsed_total <= 0.0 {
        return None;
    }

    let per_doc = elapsed_total / docs_total as f64;
    let workers = state.config.parallel.parallel_workers.max(1) as f64;
    Some(state.remaining_documents() as f64 * per_doc / workers)
}
