//! distguardd - distribution integrity verification daemon
//!
//! Runs the verifier against this host on its daily schedule, or when an
//! operator drops the force flag, and writes each report to the report
//! directory.
//!
//! The Tokio runtime is built after argument parsing and the instance lock,
//! from a synchronous `main`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use distguard_core::CancelFlag;
use distguard_core::accounts::NssAccounts;
use distguard_core::config::{DEFAULT_CONFIG_PATH, DistguardConfig};
use distguard_core::store::SqliteManifestStore;
use distguard_daemon::{JsonFileSink, LogSink, Runner, RunnerContext};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// distguardd command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "distguardd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run one verification immediately and exit
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = DistguardConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let _lock = acquire_lock(&config.daemon.lock_file)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args, config))
}

/// Holds an exclusive lock on `path` for the life of the process.
fn acquire_lock(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open lock file {}", path.display()))?;
    fs2::FileExt::try_lock_exclusive(&file)
        .with_context(|| format!("another distguardd holds {}", path.display()))?;
    Ok(file)
}

async fn async_main(args: Args, config: DistguardConfig) -> Result<()> {
    let server = config.server()?;
    let store = SqliteManifestStore::open_existing(&config.store.db_path)
        .with_context(|| format!("failed to open {}", config.store.db_path.display()))?;
    let cancel = CancelFlag::new();
    let report_dir = config.daemon.report_dir.clone();
    std::fs::create_dir_all(&report_dir)
        .with_context(|| format!("failed to create {}", report_dir.display()))?;

    info!(
        hostname = %server.hostname,
        os_version = %server.os_version,
        db = %config.store.db_path.display(),
        "distguardd starting"
    );
    let include_user_dirs = config.verify.include_user_dirs;
    let unprelinker = Arc::new(config.compile.prelink_tool());
    let runner = Runner::new(RunnerContext {
        config,
        server,
        store: Arc::new(store),
        accounts: Arc::new(NssAccounts),
        unprelinker,
        sinks: vec![Arc::new(JsonFileSink::new(report_dir)), Arc::new(LogSink)],
        cancel: cancel.clone(),
    });

    let work = async {
        if args.once {
            runner.run_once(include_user_dirs).await.map(|_| ())
        } else {
            runner.run().await;
            Ok(())
        }
    };

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        result = work => result?,
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            cancel.cancel();
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
            cancel.cancel();
        }
    }
    info!("distguardd stopped");
    Ok(())
}
