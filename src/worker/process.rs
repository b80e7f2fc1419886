use super::{SpawnRequest, WorkerSpawner};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Spawns one OS subprocess per batch. Child handles are retained so our own
/// workers get reaped on liveness checks instead of lingering as zombies;
/// PIDs recovered from a previous controller run are handled through raw
/// signals.
pub struct ProcessSpawner {
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessSpawner {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, req: &SpawnRequest) -> Result<u32> {
        let log = std::fs::File::create(&req.log_file)
            .with_context(|| format!("create worker log: {}", req.log_file.display()))?;
        let err_log = log
            .try_clone()
            .with_context(|| "duplicate log handle for stderr")?;

        let mut cmd = Command::new(&req.python_exe);
        cmd.arg(&req.worker_script)
            .arg("--config")
            .arg(&req.config_file)
            .arg("--batch-mode")
            .arg("--batch-id")
            .arg(&req.batch_id)
            .arg("--output-dir")
            .arg(&req.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log));

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning worker for batch {}", req.batch_id))?;
        let pid = child.id();

        std::fs::write(&req.pid_file, pid.to_string())
            .with_context(|| format!("write pid file: {}", req.pid_file.display()))?;

        self.children.lock().expect("children lock").insert(pid, child);
        info!(batch_id = %req.batch_id, pid, "worker started");
        Ok(pid)
    }

    fn terminate(&self, pid: u32, grace: Duration) -> Result<bool> {
        if !self.is_alive(pid) {
            debug!(pid, "terminate: process already gone");
            return Ok(false);
        }

        send_sigterm(pid)?;

        let start = Instant::now();
        while start.elapsed() < grace {
            if !self.is_alive(pid) {
                debug!(pid, "worker exited on SIGTERM");
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        warn!(pid, "worker ignored SIGTERM for {grace:?}; sending SIGKILL");
        self.force_kill(pid)?;
        Ok(true)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut children = self.children.lock().expect("children lock");
        if let Some(child) = children.get_mut(&pid) {
            // try_wait both answers liveness and reaps the child once it
            // has exited.
            match child.try_wait() {
                Ok(Some(_)) => {
                    children.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            }
        } else {
            pid_alive(pid)
        }
    }
}

impl ProcessSpawner {
    fn force_kill(&self, pid: u32) -> Result<()> {
        let mut children = self.children.lock().expect("children lock");
        if let Some(mut child) = children.remove(&pid) {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(());
        }
        send_sigkill(pid)
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(anyhow!("SIGTERM to pid {pid} failed: {}", std::io::Error::last_os_error()))
    }
}

#[cfg(unix)]
fn send_sigkill(pid: u32) -> Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(anyhow!("SIGKILL to pid {pid} failed: {}", std::io::Error::last_os_error()))
    }
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> Result<()> {
    Err(anyhow!("signal-based termination is only supported on unix"))
}

#[cfg(not(unix))]
fn send_sigkill(_pid: u32) -> Result<()> {
    Err(anyhow!("signal-based termination is only supported on unix"))
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
