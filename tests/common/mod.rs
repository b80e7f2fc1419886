#![allow(dead_code)]

use anyhow::{bail, Result};
use rob_batch::config::Config;
use rob_batch::worker::{SpawnRequest, WorkerSpawner};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Recording fake for the worker seam: no real subprocesses in tests.
#[derive(Clone)]
pub struct MockSpawner {
    inner: Arc<Mutex<MockInner>>,
}

struct MockInner {
    next_pid: u32,
    spawned: Vec<SpawnRequest>,
    alive: HashSet<u32>,
    terminated: Vec<u32>,
    fail_after: Option<usize>,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                next_pid: 1000,
                spawned: Vec::new(),
                alive: HashSet::new(),
                terminated: Vec::new(),
                fail_after: None,
            })),
        }
    }

    /// Spawns succeed for the first `n` requests, then fail.
    pub fn failing_after(n: usize) -> Self {
        let s = Self::new();
        s.inner.lock().unwrap().fail_after = Some(n);
        s
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.lock().unwrap().spawned.len()
    }

    pub fn spawned_batch_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .spawned
            .iter()
            .map(|r| r.batch_id.clone())
            .collect()
    }

    pub fn terminated_pids(&self) -> Vec<u32> {
        self.inner.lock().unwrap().terminated.clone()
    }

    pub fn mark_dead(&self, pid: u32) {
        self.inner.lock().unwrap().alive.remove(&pid);
    }
}

impl WorkerSpawner for MockSpawner {
    fn spawn(&self, req: &SpawnRequest) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(limit) = inner.fail_after {
            if inner.spawned.len() >= limit {
                bail!("simulated launch failure for batch {}", req.batch_id);
            }
        }
        inner.next_pid += 1;
        let pid = inner.next_pid;
        inner.spawned.push(req.clone());
        inner.alive.insert(pid);
        std::fs::write(&req.pid_file, pid.to_string())?;
        Ok(pid)
    }

    fn terminate(&self, pid: u32, _grace: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.alive.remove(&pid);
        inner.terminated.push(pid);
        Ok(false)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.inner.lock().unwrap().alive.contains(&pid)
    }
}

/// A config rooted in a temp dir with the required sections filled in.
pub fn test_config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.paths.input_folder = root.join("docs").display().to_string();
    cfg.paths.output_folder = root.join("out").display().to_string();
    cfg.paths.work_dir = root.join("work").display().to_string();
    cfg.paths.state_dir = root.join("state").display().to_string();
    cfg.processing.worker_script = "scripts/rob_worker.py".into();
    cfg.llm_models.assessor_model = "test-model".into();
    cfg
}

/// Create `count` pdf files under `<root>/docs` and return their paths
/// in sorted order.
pub fn make_documents(root: &Path, count: usize) -> Vec<PathBuf> {
    let docs = root.join("docs");
    std::fs::create_dir_all(&docs).unwrap();
    let mut paths = Vec::new();
    for i in 0..count {
        let path = docs.join(format!("doc_{i:03}.pdf"));
        std::fs::write(&path, format!("document {i}")).unwrap();
        paths.push(path);
    }
    paths
}

/// Write a worker-style results file for a batch.
pub fn write_results(
    output_dir: &Path,
    batch_id: &str,
    entries: &[(PathBuf, &str, Option<&str>)],
) {
    std::fs::create_dir_all(output_dir).unwrap();
    let results: Vec<serde_json::Value> = entries
        .iter()
        .map(|(path, status, error)| {
            serde_json::json!({
                "document": path,
                "status": status,
                "error": error,
                "processing_seconds": 1.5,
            })
        })
        .collect();
    let body = serde_json::json!({ "batch_id": batch_id, "results": results });
    std::fs::write(
        output_dir.join(format!("{batch_id}_results.json")),
        serde_json::to_vec_pretty(&body).unwrap(),
    )
    .unwrap();
}
