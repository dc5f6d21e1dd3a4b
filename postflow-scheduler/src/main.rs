//! postflow-scheduler - Background daemon for PostFlow
//!
//! Publishes due posts, refreshes expiring credentials and syncs posts and
//! engagement back from the platforms, each job on its own cadence.

use anyhow::Context;
use clap::Parser;
use libpostflow::config::Config;
use libpostflow::logging::{LogFormat, LoggingConfig};
use libpostflow::scheduler::configured_jobs;
use libpostflow::{Database, FileLock, JobScheduler, PostflowError};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "postflow-scheduler")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing and engagement sync")]
#[command(long_about = "\
postflow-scheduler - Background daemon for PostFlow

DESCRIPTION:
    Runs four jobs inside one long-lived process:

      dispatch_due_posts    publish posts whose time has come (every 1m)
      refresh_credentials   renew expiring access tokens (every 6h at :00)
      sync_posts            mirror each account's posts (hourly at :15)
      fetch_engagement      pull likes, replies and reshares (hourly at :45)

    Only one scheduler may run per lock file. A lock left behind by a
    process that no longer exists is reclaimed automatically.

USAGE:
    # Run in foreground (logs to stderr)
    postflow-scheduler

    # Run a single job now and exit
    postflow-scheduler --once sync_posts

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight jobs finish first)

CONFIGURATION:
    Configuration file: ~/.config/postflow/config.toml (or $POSTFLOW_CONFIG)

    [scheduler]
    lock_path = \"/tmp/postflow_scheduler.lock\"
    shutdown_timeout = \"30s\"

    [scheduler.jobs.sync_posts]
    cadence = \"hourly at :15\"
    misfire_grace = \"30s\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
    3 - Another scheduler is already running
")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format: text, json or pretty
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Run the named job once and exit
    #[arg(long, value_name = "JOB")]
    once: Option<String>,

    /// Lock file location (overrides config)
    #[arg(long, value_name = "PATH")]
    lock_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(cli.log_format, "info", cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<PostflowError>()
            .map(PostflowError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    let db = Database::new(&config.database.path)
        .await
        .with_context(|| format!("opening database {}", config.database.path))?;

    let lock_path = cli
        .lock_path
        .clone()
        .unwrap_or_else(|| config.scheduler.lock_path());
    let drain = config.scheduler.shutdown_timeout()?;

    let mut scheduler = JobScheduler::new(Box::new(FileLock::new(&lock_path)));
    for (spec, job) in configured_jobs(&config, db)? {
        scheduler.add_job(spec, job)?;
    }

    if let Some(name) = &cli.once {
        info!(job = %name, "Running single job");
        if !scheduler.run_once(name).await? {
            anyhow::bail!("job '{}' failed", name);
        }
        info!(job = %name, "Single run complete, exiting");
        return Ok(());
    }

    let signals = ShutdownSignal::install()?;

    info!(lock = %lock_path.display(), "postflow-scheduler starting");
    scheduler.start()?;

    signals.wait().await;
    info!("Received shutdown signal, stopping gracefully...");

    scheduler.shutdown(drain).await?;
    info!("postflow-scheduler stopped");
    Ok(())
}

#[cfg(unix)]
struct ShutdownSignal {
    signals: signal_hook_tokio::Signals,
}

#[cfg(unix)]
impl ShutdownSignal {
    fn install() -> anyhow::Result<Self> {
        use signal_hook::consts::{SIGINT, SIGTERM};

        let signals = signal_hook_tokio::Signals::new([SIGINT, SIGTERM])
            .context("installing signal handlers")?;
        Ok(Self { signals })
    }

    async fn wait(mut self) {
        use futures::StreamExt;

        if let Some(signal) = self.signals.next().await {
            info!(signal, "Signal received");
        }
        self.signals.handle().close();
    }
}

#[cfg(not(unix))]
struct ShutdownSignal;

#[cfg(not(unix))]
impl ShutdownSignal {
    fn install() -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn wait(self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}
