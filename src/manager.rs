use crate::{
    capacity,
    config::Config,
    monitor::ProgressMonitor,
    state::{
        AssessmentState, BatchState, BatchStatus, DocumentState, DocumentStatus, SessionStatus,
    },
    state_manager::StateManager,
    util::{ensure_dir, hash_file},
    worker::{BatchResults, BatchWorkerConfig, SpawnRequest, WorkerSpawner},
};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pre-flight report for a planned distribution. Issues block the start;
/// warnings are advisory capacity findings and do not.
#[derive(Debug, Default)]
pub struct DistributionReport {
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl DistributionReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// One document whose recorded outcome changed during reconciliation.
/// `wait_for_completion` feeds these to the progress monitor.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub batch_id: String,
    pub document: String,
    pub completed: bool,
    pub error: Option<String>,
    pub processing_seconds: Option<f64>,
}

/// Orchestrates document discovery, batch partitioning, worker process
/// lifecycle and checkpointing. Owns the in-memory [`AssessmentState`];
/// the [`StateManager`] owns its persisted form.
pub struct AssessmentManager<W: WorkerSpawner> {
    cfg: Config,
    states: StateManager,
    spawner: W,
}

impl<W: WorkerSpawner> AssessmentManager<W> {
    pub fn new(cfg: &Config, spawner: W) -> Result<Self> {
        let states = StateManager::new(Path::new(&cfg.paths.state_dir))?;
        Ok(Self {
            cfg: cfg.clone(),
            states,
            spawner,
        })
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.states
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn spawner(&self) -> &W {
        &self.spawner
    }

    /// Recursive walk of the input folder filtered by supported extensions.
    /// The returned list is sorted and deduplicated; stable ordering is what
    /// keeps batch membership deterministic across restarts.
    pub fn discover_documents(&self) -> Result<Vec<PathBuf>> {
        let folder = Path::new(&self.cfg.paths.input_folder);
        if !folder.is_dir() {
            bail!("input folder not found: {}", folder.display());
        }

        let exts: BTreeSet<String> = self
            .cfg
            .processing
            .supported_extensions
            .iter()
            .map(|e| e.to_ascii_lowercase())
            .collect();

        let mut found = BTreeSet::new();
        collect_documents(folder, &exts, &mut found)?;

        if found.is_empty() {
            bail!(
                "no documents with supported extensions ({}) under {}",
                self.cfg.processing.supported_extensions.join(", "),
                folder.display()
            );
        }
        Ok(found.into_iter().collect())
    }

    /// `min(max_batch_size, ceil(total / workers))`, floored at 1: even
    /// distribution across workers, bounded by the per-batch cap.
    pub fn optimal_batch_size(&self, total_documents: usize, workers: usize) -> usize {
        let workers = workers.max(1);
        let even = total_documents.div_ceil(workers).max(1);
        even.min(self.cfg.parallel.max_documents_per_batch.max(1))
    }

    /// Positional chunking of the sorted document list. Batch ids and
    /// membership are a pure function of (documents, config), which resume
    /// relies on to align old batch definitions with a rescan.
    pub fn distribute_documents(
        &self,
        session_id: &str,
        documents: &[PathBuf],
    ) -> Vec<BatchState> {
        let size = self.optimal_batch_size(documents.len(), self.cfg.parallel.parallel_workers);
        let output_root = Path::new(&self.cfg.paths.output_folder).join(session_id);

        documents
            .chunks(size)
            .enumerate()
            .map(|(index, chunk)| {
                let id = format!("{session_id}_batch_{index:03}");
                let docs = chunk
                    .iter()
                    .map(|p| {
                        let mut d = DocumentState::new(p.clone());
                        if self.cfg.processing.checksum_documents {
                            d.content_checksum = hash_file(p).ok();
                        }
                        d
                    })
                    .collect();
                let output_dir = output_root.join(&id);
                BatchState::new(id, docs, output_dir)
            })
            .collect()
    }

    /// Pre-flight checks, all collected before any worker launches.
    pub fn validate_batch_distribution(&self, documents: &[PathBuf]) -> DistributionReport {
        let work_dir = Path::new(&self.cfg.paths.work_dir);
        let mut report = DistributionReport {
            issues: self.cfg.section_issues(),
            warnings: capacity::resource_warnings(
                self.cfg.parallel.parallel_workers,
                documents.len(),
                work_dir,
            ),
        };

        for doc in documents {
            if !doc.exists() {
                report
                    .issues
                    .push(format!("document missing: {}", doc.display()));
            }
        }

        if let Err(e) = ensure_dir(work_dir) {
            report.issues.push(format!("work dir unusable: {e}"));
        } else if let Err(e) = capacity::probe_writable(work_dir) {
            report.issues.push(e);
        }

        report
    }

    /// Full fresh-start flow: discover, validate, distribute, persist,
    /// launch. Any validation issue aborts before a single worker starts.
    pub fn start_assessment(&mut self) -> Result<AssessmentState> {
        let documents = self.discover_documents()?;
        let report = self.validate_batch_distribution(&documents);
        for w in &report.warnings {
            warn!("{w}");
        }
        if !report.is_valid() {
            bail!(
                "pre-flight validation failed; no workers started: {}",
                report.issues.join("; ")
            );
        }

        let session_id = Uuid::new_v4().to_string();
        let work_dir = Path::new(&self.cfg.paths.work_dir).join(&session_id);
        let output_dir = Path::new(&self.cfg.paths.output_folder).join(&session_id);
        ensure_dir(&work_dir)?;
        ensure_dir(&output_dir)?;

        if self.cfg.debug.dump_effective_config {
            let raw = toml::to_string(&self.cfg).unwrap_or_default();
            std::fs::write(work_dir.join("effective-config.toml"), raw)?;
        }

        let mut state = AssessmentState::new(
            session_id.clone(),
            self.cfg.clone(),
            work_dir,
            output_dir,
        );
        state.batches = self.distribute_documents(&session_id, &documents);
        state.update_counters();
        self.states.save_state(&mut state)?;

        info!(
            session_id = %state.session_id,
            documents = state.total_documents,
            batches = state.batches.len(),
            "assessment session created"
        );

        let requests = self.create_worker_configs(&mut state, None)?;
        self.start_worker_processes(&mut state, &requests)?;

        state.status = SessionStatus::Running;
        self.states.save_state(&mut state)?;
        Ok(state)
    }

    /// Serialize each batch's scoped config next to its log/pid files and
    /// build the spawn requests. `only` restricts to the named batches
    /// (resume relaunches a subset).
    fn create_worker_configs(
        &self,
        state: &mut AssessmentState,
        only: Option<&BTreeSet<String>>,
    ) -> Result<Vec<SpawnRequest>> {
        // The config snapshot in the state drives workers, not the live
        // config: resume must not depend on external config mutation.
        let cfg = state.config.clone();
        let mut requests = Vec::new();

        for batch in &mut state.batches {
            if let Some(only) = only {
                if !only.contains(&batch.id) {
                    continue;
                }
            }

            ensure_dir(&batch.output_dir)?;

            let config_file = state.work_dir.join(format!("{}_config.json", batch.id));
            let worker_config = BatchWorkerConfig {
                batch_id: batch.id.clone(),
                documents: batch.documents.iter().map(|d| d.path.clone()).collect(),
                output_dir: batch.output_dir.clone(),
                llm_models: cfg.llm_models.clone(),
                processing: cfg.processing.clone(),
            };
            std::fs::write(&config_file, serde_json::to_vec_pretty(&worker_config)?)
                .with_context(|| format!("write batch config: {}", config_file.display()))?;
            batch.config_file = Some(config_file.clone());

            requests.push(SpawnRequest {
                batch_id: batch.id.clone(),
                python_exe: cfg.processing.python_exe.clone(),
                worker_script: PathBuf::from(&cfg.processing.worker_script),
                config_file,
                output_dir: batch.output_dir.clone(),
                log_file: state.work_dir.join(format!("{}_worker.log", batch.id)),
                pid_file: state.work_dir.join(format!("{}_worker.pid", batch.id)),
            });
        }
        Ok(requests)
    }

    /// Launch one worker per request. A failure terminates every worker
    /// already started in this invocation before the error is surfaced; a
    /// half-launched fleet is never left running unmanaged.
    fn start_worker_processes(
        &self,
        state: &mut AssessmentState,
        requests: &[SpawnRequest],
    ) -> Result<()> {
        let grace = Duration::from_secs(state.config.parallel.stop_grace_seconds);
        let mut started: Vec<(String, u32)> = Vec::new();

        for req in requests {
            match self.spawner.spawn(req) {
                Ok(pid) => {
                    if let Some(batch) = state.batches.iter_mut().find(|b| b.id == req.batch_id) {
                        batch.status = BatchStatus::Running;
                        batch.started_at = Some(OffsetDateTime::now_utc());
                        batch.worker_pid = Some(pid);
                    }
                    started.push((req.batch_id.clone(), pid));
                }
                Err(e) => {
                    warn!(
                        batch_id = %req.batch_id,
                        "worker launch failed; rolling back {} started worker(s)",
                        started.len()
                    );
                    for (batch_id, pid) in &started {
                        if let Err(te) = self.spawner.terminate(*pid, grace) {
                            warn!(batch_id = %batch_id, pid, "rollback termination failed: {te}");
                        }
                        if let Some(batch) =
                            state.batches.iter_mut().find(|b| &b.id == batch_id)
                        {
                            batch.status = BatchStatus::Pending;
                            batch.started_at = None;
                            batch.worker_pid = None;
                        }
                    }
                    state.status = SessionStatus::Failed;
                    let _ = self.states.save_state(state);
                    return Err(e.context(format!(
                        "launching worker for batch {} (rolled back)",
                        req.batch_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reconcile batches against on-disk result files. After a restart the
    /// results artifacts are the only trusted record of what survived;
    /// in-memory state is not. Returns the per-document outcome changes
    /// observed in this pass.
    pub fn detect_completed_work(&self, batches: &mut [BatchState]) -> Vec<DocumentChange> {
        let mut changes = Vec::new();

        for batch in batches.iter_mut() {
            if batch.status.is_terminal() {
                continue;
            }

            let results_path = batch.output_dir.join(format!("{}_results.json", batch.id));
            if !results_path.exists() {
                continue;
            }
            let results: BatchResults = match std::fs::read(&results_path)
                .map_err(anyhow::Error::from)
                .and_then(|b| serde_json::from_slice(&b).map_err(anyhow::Error::from))
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(batch_id = %batch.id, "unreadable results file: {e}");
                    continue;
                }
            };

            let mut completed_entries = 0usize;
            let mut failed_entries = 0usize;

            for entry in &results.results {
                if entry.is_completed() {
                    completed_entries += 1;
                } else if entry.is_failed() {
                    failed_entries += 1;
                }

                // Map entries onto document states by path where they match,
                // so the checkpoint carries per-document outcomes. Batch
                // completion itself stays count-based.
                let Some(doc) = batch
                    .documents
                    .iter_mut()
                    .find(|d| d.path == entry.document)
                else {
                    continue;
                };
                let new_status = if entry.status == "skipped" {
                    DocumentStatus::Skipped
                } else if entry.is_completed() {
                    DocumentStatus::Completed
                } else if entry.is_failed() {
                    DocumentStatus::Failed
                } else {
                    continue;
                };
                if doc.status == new_status {
                    continue;
                }
                doc.status = new_status;
                doc.error = entry.error.clone();
                doc.finished_at = Some(OffsetDateTime::now_utc());
                if new_status != DocumentStatus::Failed {
                    doc.result_file = Some(results_path.clone());
                }
                changes.push(DocumentChange {
                    batch_id: batch.id.clone(),
                    document: entry.document.display().to_string(),
                    completed: new_status != DocumentStatus::Failed,
                    error: entry.error.clone(),
                    processing_seconds: entry.processing_seconds,
                });
            }

            let total = batch.documents.len().max(1);
            batch.progress = ((completed_entries.min(total) as f64 / total as f64) * 100.0)
                .round() as u8;

            if completed_entries >= batch.documents.len() {
                batch.status = BatchStatus::Completed;
            } else if completed_entries + failed_entries >= batch.documents.len() {
                batch.status = BatchStatus::CompletedWithErrors;
            }
            if batch.status.is_terminal() && batch.finished_at.is_none() {
                batch.finished_at = Some(OffsetDateTime::now_utc());
                debug!(batch_id = %batch.id, status = ?batch.status, "batch resolved");
            }
        }

        changes
    }

    /// Load the last valid checkpoint, reconcile against result files, and
    /// relaunch only what is still incomplete.
    pub fn resume_assessment(&mut self, session_id: &str) -> Result<AssessmentState> {
        let mut state = self
            .states
            .load_state(session_id, true)
            .with_context(|| format!("loading state for session {session_id}"))?;

        let issues = self.states.validate_state(&state);
        if !issues.is_empty() {
            bail!(
                "state for session {session_id} failed validation: {}",
                issues.join("; ")
            );
        }

        self.detect_completed_work(&mut state.batches);

        // Anything the dead worker had in flight goes back to pending and
        // gets another attempt.
        let mut to_restart = BTreeSet::new();
        for batch in &mut state.batches {
            if batch.status.is_terminal() {
                continue;
            }
            for doc in &mut batch.documents {
                if doc.status == DocumentStatus::Processing {
                    doc.status = DocumentStatus::Pending;
                    doc.retry_count += 1;
                }
            }
            batch.status = BatchStatus::Pending;
            batch.worker_pid = None;
            to_restart.insert(batch.id.clone());
        }

        state.update_counters();

        if to_restart.is_empty() {
            info!(session_id, "nothing to resume; all batches terminal");
            state.status = session_outcome(&state);
            self.states.save_state(&mut state)?;
            return Ok(state);
        }

        info!(
            session_id,
            restarting = to_restart.len(),
            completed = state.completed_documents,
            total = state.total_documents,
            "resuming incomplete batches"
        );

        ensure_dir(&state.work_dir)?;
        let requests = self.create_worker_configs(&mut state, Some(&to_restart))?;
        self.start_worker_processes(&mut state, &requests)?;

        state.status = SessionStatus::Running;
        self.states.save_state(&mut state)?;
        Ok(state)
    }

    /// Terminate every running worker: SIGTERM, bounded grace, SIGKILL.
    /// Stopped batches go back to `pending`, never `failed`, so an operator
    /// stop is always distinguishable from a crash. Safe to call twice;
    /// nothing running is success with zero stopped.
    pub fn stop_all_processes(&mut self, session_id: &str) -> Result<usize> {
        let mut state = match self.states.load_state(session_id, false) {
            Ok(s) => s,
            Err(crate::state_manager::StateError::NotFound(_)) => {
                return Err(anyhow!("no saved state for session {session_id}"));
            }
            Err(e) => return Err(e).context("loading state for stop"),
        };

        let grace = Duration::from_secs(state.config.parallel.stop_grace_seconds);
        let mut stopped = 0usize;

        for batch in &mut state.batches {
            if batch.status != BatchStatus::Running {
                continue;
            }
            let pid = batch
                .worker_pid
                .or_else(|| read_pid_file(&state.work_dir, &batch.id));
            if let Some(pid) = pid {
                if self.spawner.is_alive(pid) {
                    match self.spawner.terminate(pid, grace) {
                        Ok(forced) => {
                            stopped += 1;
                            if forced {
                                warn!(batch_id = %batch.id, pid, "worker required SIGKILL");
                            }
                        }
                        Err(e) => warn!(batch_id = %batch.id, pid, "termination failed: {e}"),
                    }
                }
            }
            batch.status = BatchStatus::Pending;
            batch.worker_pid = None;
            batch.started_at = None;
            let _ = std::fs::remove_file(state.work_dir.join(format!("{}_worker.pid", batch.id)));
        }

        state.status = SessionStatus::Paused;
        state.update_counters();
        self.states.save_state(&mut state)?;
        info!(session_id, stopped, "stop complete");
        Ok(stopped)
    }

    /// Controller-side polling loop: reconcile, feed the monitor, checkpoint,
    /// until every batch is terminal. The spawn itself never blocks; this is
    /// the separate detection pass the architecture relies on.
    pub fn wait_for_completion(
        &self,
        state: &mut AssessmentState,
        monitor: Option<&ProgressMonitor>,
        poll_interval: Duration,
    ) -> Result<()> {
        if let Some(monitor) = monitor {
            for batch in &state.batches {
                monitor.register_batch(&batch.id, batch.documents.len());
            }
        }

        // Batches whose worker has died, by consecutive passes observed dead.
        // A batch fails on the second pass: the intervening reconcile gives a
        // worker that exited right after writing its results file the chance
        // to be counted complete instead.
        let mut dead_strikes: BTreeMap<String, u32> = BTreeMap::new();

        loop {
            let changes = self.detect_completed_work(&mut state.batches);

            for batch in &mut state.batches {
                if batch.status != BatchStatus::Running {
                    continue;
                }
                let Some(pid) = batch.worker_pid else { continue };
                if self.spawner.is_alive(pid) {
                    dead_strikes.remove(&batch.id);
                    continue;
                }
                let strikes = dead_strikes.entry(batch.id.clone()).or_insert(0);
                *strikes += 1;
                if *strikes >= 2 {
                    warn!(batch_id = %batch.id, pid, "worker died with batch incomplete");
                    batch.status = BatchStatus::Failed;
                    batch.error = Some("worker exited before completing its batch".into());
                    batch.finished_at = Some(OffsetDateTime::now_utc());
                }
            }
            if let Some(monitor) = monitor {
                for change in &changes {
                    monitor.update_batch_progress(
                        &change.batch_id,
                        &change.document,
                        change.processing_seconds,
                        change.error.as_deref(),
                        None,
                    );
                }
            }

            state.update_counters();
            self.states.save_state(state)?;

            if state.all_batches_terminal() {
                state.status = session_outcome(state);
                self.states.save_state(state)?;
                if !state.config.debug.keep_worker_logs {
                    self.remove_worker_logs(state);
                }
                info!(
                    session_id = %state.session_id,
                    completed = state.completed_documents,
                    failed = state.failed_documents,
                    status = ?state.status,
                    "all batches terminal"
                );
                return Ok(());
            }

            std::thread::sleep(poll_interval);
        }
    }

    fn remove_worker_logs(&self, state: &AssessmentState) {
        for batch in &state.batches {
            let _ = std::fs::remove_file(state.work_dir.join(format!("{}_worker.log", batch.id)));
        }
    }

    /// Collected contents of each batch's worker log.
    pub fn session_logs(&self, session_id: &str) -> Result<BTreeMap<String, String>> {
        let state = self
            .states
            .load_state(session_id, false)
            .with_context(|| format!("loading state for session {session_id}"))?;

        let mut logs = BTreeMap::new();
        for batch in &state.batches {
            let path = state.work_dir.join(format!("{}_worker.log", batch.id));
            if let Ok(contents) = std::fs::read_to_string(&path) {
                logs.insert(batch.id.clone(), contents);
            }
        }
        Ok(logs)
    }
}

/// Session outcome once every batch is terminal: any hard-failed batch
/// fails the session, otherwise it completed (possibly with document-level
/// errors, which do not fail the run).
pub fn session_outcome(state: &AssessmentState) -> SessionStatus {
    if state
        .batches
        .iter()
        .any(|b| b.status == BatchStatus::Failed)
    {
        SessionStatus::Failed
    } else {
        SessionStatus::Completed
    }
}

pub fn read_pid_file(work_dir: &Path, batch_id: &str) -> Option<u32> {
    let path = work_dir.join(format!("{batch_id}_worker.pid"));
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub(crate) fn collect_documents(
    dir: &Path,
    exts: &BTreeSet<String>,
    out: &mut BTreeSet<PathBuf>,
) -> Result<()> {
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_documents(&path, exts, out)?;
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if exts.contains(&ext.to_ascii_lowercase()) {
                out.insert(path);
            }
        }
    }
    Ok(())
}
