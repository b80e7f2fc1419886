use crate::{
    capacity,
    config::Config,
    manager::AssessmentManager,
    merge,
    monitor::ProgressMonitor,
    resume::ResumeManager,
    state::AssessmentState,
    util::ensure_dir,
    worker::ProcessSpawner,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "rob-batch")]
#[command(about = "Parallel risk-of-bias assessment orchestrator (batching + checkpoint/resume)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./rob-batch.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report detected system capacity for the configured worker count.
    Doctor {},
    /// Discover documents, distribute batches, launch workers.
    Start {
        /// Return right after launch instead of polling to completion.
        #[arg(long)]
        no_wait: bool,
    },
    /// Restart unfinished work from the last valid checkpoint.
    Resume {
        #[arg(long)]
        session: String,
        /// Resume even when preview issues exist.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        no_wait: bool,
    },
    /// Show what a resume would do, without touching any process.
    Preview {
        #[arg(long)]
        session: String,
    },
    /// List persisted sessions, newest first.
    Sessions {},
    /// Terminate a session's workers and leave it resumable.
    Stop {
        #[arg(long)]
        session: String,
    },
    /// Print collected worker logs for a session.
    Logs {
        #[arg(long)]
        session: String,
    },
    /// Consolidate per-batch result files into one artifact.
    Merge {
        #[arg(long)]
        session: String,
    },
    /// Delete state files older than the given age.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        max_age_days: u64,
        /// Also remove backups older than the threshold.
        #[arg(long)]
        purge_backups: bool,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref())?;
    let cfg = Config::load(&cfg_path)?;
    let _guard = init_logging(&args, &cfg, resolve_log_path(&cfg).as_deref())?;

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Start { no_wait } => start(&cfg, *no_wait),
        Command::Resume {
            session,
            force,
            no_wait,
        } => resume(&cfg, session, *force, *no_wait),
        Command::Preview { session } => preview(&cfg, session),
        Command::Sessions {} => sessions(&cfg),
        Command::Stop { session } => stop(&cfg, session),
        Command::Logs { session } => logs(&cfg, session),
        Command::Merge { session } => merge_cmd(&cfg, session),
        Command::Cleanup {
            max_age_days,
            purge_backups,
        } => cleanup(&cfg, *max_age_days, *purge_backups),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = user {
        return Ok(p.to_path_buf());
    }
    let default = PathBuf::from("rob-batch.toml");
    if default.exists() {
        Ok(default)
    } else {
        Ok(PathBuf::from("rob-batch.example.toml"))
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.paths.state_dir).join("rob-batch.log"))
}

fn doctor(cfg: &Config) -> Result<()> {
    let work_dir = Path::new(&cfg.paths.work_dir);
    let detected = capacity::detect(cfg.parallel.parallel_workers, work_dir);
    let warnings = capacity::resource_warnings(cfg.parallel.parallel_workers, 0, work_dir);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "capacity": detected,
            "configured_workers": cfg.parallel.parallel_workers,
            "config_issues": cfg.section_issues(),
            "warnings": warnings,
        }))?
    );
    Ok(())
}

fn start(cfg: &Config, no_wait: bool) -> Result<()> {
    let mut manager = AssessmentManager::new(cfg, ProcessSpawner::new())?;
    let mut state = manager.start_assessment()?;
    info!(session_id = %state.session_id, "workers launched");

    if no_wait {
        print_session_summary(cfg, &state)?;
        return Ok(());
    }

    watch(cfg, &manager, &mut state)?;
    print_session_summary(cfg, &state)
}

fn resume(cfg: &Config, session_id: &str, force: bool, no_wait: bool) -> Result<()> {
    let mut manager = AssessmentManager::new(cfg, ProcessSpawner::new())?;
    let mut state = ResumeManager::new(&mut manager).resume(session_id, force)?;

    if no_wait || state.all_batches_terminal() {
        print_session_summary(cfg, &state)?;
        return Ok(());
    }

    watch(cfg, &manager, &mut state)?;
    print_session_summary(cfg, &state)
}

fn watch(
    cfg: &Config,
    manager: &AssessmentManager<ProcessSpawner>,
    state: &mut AssessmentState,
) -> Result<()> {
    let interval = Duration::from_secs(cfg.global.poll_interval_seconds.max(1));
    let mut monitor = ProgressMonitor::new(
        &state.session_id,
        manager.state_manager().progress_path(&state.session_id),
        interval,
    );
    monitor.start_monitoring();
    let outcome = manager.wait_for_completion(state, Some(&monitor), interval);
    monitor.stop_monitoring();
    outcome
}

fn preview(cfg: &Config, session_id: &str) -> Result<()> {
    let mut manager = AssessmentManager::new(cfg, ProcessSpawner::new())?;
    let preview = ResumeManager::new(&mut manager).preview(session_id)?;
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}

fn sessions(cfg: &Config) -> Result<()> {
    let manager = AssessmentManager::new(cfg, ProcessSpawner::new())?;
    let rows = manager.state_manager().list_sessions()?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn stop(cfg: &Config, session_id: &str) -> Result<()> {
    let mut manager = AssessmentManager::new(cfg, ProcessSpawner::new())?;
    let stopped = manager.stop_all_processes(session_id)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "session_id": session_id,
            "stopped_workers": stopped,
        }))?
    );
    Ok(())
}

fn logs(cfg: &Config, session_id: &str) -> Result<()> {
    let manager = AssessmentManager::new(cfg, ProcessSpawner::new())?;
    for (batch_id, contents) in manager.session_logs(session_id)? {
        println!("==== {batch_id} ====");
        println!("{contents}");
    }
    Ok(())
}

fn merge_cmd(cfg: &Config, session_id: &str) -> Result<()> {
    let manager = AssessmentManager::new(cfg, ProcessSpawner::new())?;
    let state = manager.state_manager().load_state(session_id, true)?;
    let report = merge::merge_session(&state)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cleanup(cfg: &Config, max_age_days: u64, purge_backups: bool) -> Result<()> {
    let manager = AssessmentManager::new(cfg, ProcessSpawner::new())?;
    let removed = manager
        .state_manager()
        .cleanup_old_states(max_age_days, !purge_backups)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "removed_sessions": removed,
            "max_age_days": max_age_days,
        }))?
    );
    Ok(())
}

fn print_session_summary(cfg: &Config, state: &AssessmentState) -> Result<()> {
    if !cfg.global.print_summary {
        return Ok(());
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "session_id": state.session_id,
            "status": state.status,
            "total_documents": state.total_documents,
            "completed_documents": state.completed_documents,
            "failed_documents": state.failed_documents,
            "batches": state.batches.len(),
            "output_dir": state.output_dir,
        }))?
    );
    Ok(())
}
