use serde::Serialize;
use std::path::Path;

/// Give each worker at least this much headroom before warning.
const MIN_MEMORY_PER_WORKER_BYTES: u64 = 1 << 30;
const MIN_FREE_DISK_BYTES: u64 = 1 << 30;

/// Snapshot of what this machine can reasonably run. Memory and disk
/// readings are best-effort and absent on platforms that refuse to answer.
#[derive(Debug, Clone, Serialize)]
pub struct SystemCapacity {
    pub cpu_count: usize,
    pub total_memory_bytes: Option<u64>,
    pub available_disk_bytes: Option<u64>,
    pub recommended_workers: usize,
}

/// Pick a worker count from the CPU count and the configured request.
/// Advisory only: warnings from `resource_warnings` never abort a run by
/// themselves.
pub fn detect(requested_workers: usize, work_dir: &Path) -> SystemCapacity {
    let cpu_count = num_cpus::get();
    let recommended_workers = requested_workers.min(cpu_count).max(1);
    SystemCapacity {
        cpu_count,
        total_memory_bytes: total_memory_bytes(),
        available_disk_bytes: available_disk_bytes(work_dir),
        recommended_workers,
    }
}

pub fn resource_warnings(
    requested_workers: usize,
    total_documents: usize,
    work_dir: &Path,
) -> Vec<String> {
    let mut warnings = Vec::new();
    let capacity = detect(requested_workers, work_dir);

    if requested_workers > capacity.cpu_count {
        warnings.push(format!(
            "parallel_workers ({requested_workers}) exceeds available CPUs ({}); \
             workers will contend for cores",
            capacity.cpu_count
        ));
    }
    if total_documents > 0 && total_documents < requested_workers {
        warnings.push(format!(
            "only {total_documents} documents for {requested_workers} workers; \
             some workers will be idle"
        ));
    }
    if let Some(total) = capacity.total_memory_bytes {
        let per_worker = total / requested_workers.max(1) as u64;
        if per_worker < MIN_MEMORY_PER_WORKER_BYTES {
            warnings.push(format!(
                "{} MiB of memory across {requested_workers} workers leaves {} MiB each; \
                 document processing may swap",
                total >> 20,
                per_worker >> 20
            ));
        }
    }
    if let Some(free) = capacity.available_disk_bytes {
        if free < MIN_FREE_DISK_BYTES {
            warnings.push(format!(
                "only {} MiB free on the work dir filesystem",
                free >> 20
            ));
        }
    }

    warnings
}

/// Write-and-delete a probe file to prove the directory accepts writes.
pub fn probe_writable(dir: &Path) -> Result<(), String> {
    let probe = dir.join(".rob-batch-probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(e) => Err(format!("work dir not writable: {}: {e}", dir.display())),
    }
}

#[cfg(unix)]
fn total_memory_bytes() -> Option<u64> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages > 0 && page_size > 0 {
        Some(pages as u64 * page_size as u64)
    } else {
        None
    }
}

#[cfg(unix)]
fn available_disk_bytes(dir: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    // The work dir may not exist yet on a fresh run; fall back to cwd so
    // the reading still reflects the right filesystem in the common case.
    let target = if dir.exists() { dir } else { Path::new(".") };
    let c_path = CString::new(target.as_os_str().as_bytes()).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) } != 0 {
        return None;
    }
    Some(stats.f_bavail as u64 * stats.f_frsize as u64)
}

#[cfg(not(unix))]
fn total_memory_bytes() -> Option<u64> {
    None
}

#[cfg(not(unix))]
fn available_disk_bytes(_dir: &Path) -> Option<u64> {
    None
}
