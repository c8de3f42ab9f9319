use std::sync::Arc;

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use memva::{
    agent::AgentStreamer,
    config::MemvaConfig,
    jobs::{database_backup, database_vacuum, maintenance, session_sync},
    permission::PermissionBroker,
    queue::JobQueue,
    session::runner::SessionRunnerHandler,
    storage::Store,
    worker::WorkerPool,
    AppContext,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "memvad", about = "Memva daemon — job queue, event pipeline, and permission broker for long-running coding agent sessions", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API port
    #[arg(long, env = "MEMVA_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite database and MCP sidecar configs
    #[arg(long, env = "MEMVA_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Environment: dev, prod, or test — selects which SQLite file to open
    #[arg(long, env = "MEMVA_ENV")]
    env: Option<String>,

    /// Number of concurrent job-queue workers
    #[arg(long, env = "MEMVA_WORKERS")]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MEMVA_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "MEMVA_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand is given).
    Serve,
    /// Check that the `claude` CLI is reachable and print environment info.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Doctor) => run_doctor(),
        None | Some(Command::Serve) => {
            run_server(args.port, args.data_dir, args.env, args.workers, args.log).await
        }
    }
}

fn run_doctor() -> Result<()> {
    let available = std::process::Command::new("claude")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok();

    println!("memvad {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  claude CLI on PATH: {}",
        if available { "yes" } else { "no — install it before running `serve`" }
    );

    if available {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("memvad.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    env: Option<String>,
    workers: Option<usize>,
    log: Option<String>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "memvad starting");

    let config = MemvaConfig::new(port, data_dir, env, workers, log, None);
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        workers = config.workers,
        env = config.env_name(),
        "config loaded"
    );

    let available = std::process::Command::new("claude")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok();
    if available {
        info!("agent CLI found on PATH");
    } else {
        warn!("`claude` not found on PATH — session-runner jobs will fail until it is installed");
    }

    let store = Store::open(&config.data_dir, config.env_name()).await?;

    let (sessions_recovered, jobs_recovered) = store.recover_on_startup().await?;
    if sessions_recovered > 0 || jobs_recovered > 0 {
        info!(sessions_recovered, jobs_recovered, "recovered state from previous run");
    }

    // The schema seeds the global settings row with built-in defaults;
    // reapply whatever config.toml/CLI/env actually resolved to so those
    // overrides aren't silently ignored on every restart.
    store
        .update_global_settings(
            config.max_turns,
            &config.permission_mode,
            config.default_directory.as_deref(),
        )
        .await?;

    let mcp_sidecar_path = std::env::current_exe()?
        .parent()
        .map(|dir| dir.join("memva-permission-mcp"))
        .unwrap_or_else(|| std::path::PathBuf::from("memva-permission-mcp"));

    let ctx = Arc::new(AppContext::new(config, store.clone()));

    let streamer = AgentStreamer::new(
        store.clone(),
        ctx.abort_registry.clone(),
        ctx.config.agent_timeout_secs,
        mcp_sidecar_path,
        ctx.config.data_dir.clone(),
        ctx.config.env_name().to_string(),
    );
    let permissions = PermissionBroker::new(store.clone());
    let session_runner = Arc::new(SessionRunnerHandler::new(store.clone(), streamer, permissions));

    bootstrap_periodic_jobs(&ctx.queue).await?;

    let maintenance_handler = Arc::new(maintenance::MaintenanceHandler::new(
        store.clone(),
        ctx.queue.clone(),
        ChronoDuration::minutes(10),
        ChronoDuration::seconds(60),
    ));
    let session_sync_handler = Arc::new(session_sync::SessionSyncHandler::new(
        store.clone(),
        ctx.queue.clone(),
        ChronoDuration::minutes(5),
    ));
    let vacuum_handler = Arc::new(database_vacuum::DatabaseVacuumHandler::new(
        store.clone(),
        ctx.queue.clone(),
        30,
        ChronoDuration::hours(24),
    ));
    let backup_handler = Arc::new(database_backup::DatabaseBackupHandler::new(
        store.clone(),
        ctx.queue.clone(),
        ctx.config.data_dir.join("backups"),
        ChronoDuration::hours(6),
    ));

    let shutdown = tokio_util::sync::CancellationToken::new();

    let pool = WorkerPool::new(ctx.queue.clone(), ctx.config.workers)
        .register("session-runner", session_runner)
        .register(maintenance::JOB_TYPE, maintenance_handler)
        .register(session_sync::JOB_TYPE, session_sync_handler)
        .register(database_vacuum::JOB_TYPE, vacuum_handler)
        .register(database_backup::JOB_TYPE, backup_handler);
    let worker_handles = pool.spawn(shutdown.clone());

    let rest_shutdown = shutdown.clone();
    tokio::select! {
        result = memva::rest::start_rest_server(ctx) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            rest_shutdown.cancel();
        }
    }

    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }

    Ok(())
}

/// Enqueue one occurrence of each periodic job type if none is already
/// pending/running — first boot, or a restart after the last one finished
/// and its self-rescheduled successor hasn't come due yet.
async fn bootstrap_periodic_jobs(queue: &JobQueue) -> Result<()> {
    for (job_type, priority) in [
        (maintenance::JOB_TYPE, maintenance::PRIORITY),
        (session_sync::JOB_TYPE, session_sync::PRIORITY),
        (database_vacuum::JOB_TYPE, database_vacuum::PRIORITY),
        (database_backup::JOB_TYPE, database_backup::PRIORITY),
    ] {
        if queue.active_job_of_type(job_type).await?.is_none() {
            queue.enqueue(job_type, "{}", priority, 1).await?;
        }
    }
    Ok(())
}
