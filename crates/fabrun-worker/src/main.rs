//! fabrun worker daemon: the Factory-PC agent of a central Control Center.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use fabrun_worker::config::{Cli, Config};
use fabrun_worker::server::RequestQueue;
use fabrun_worker::status::RunStatus;
use fabrun_worker::sync::SyncLoop;
use fabrun_worker::VERSION;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => return fatal_error(&e.to_string()),
    };

    if let Err(e) = init_logging(&cli, &config) {
        return fatal_error(&format!("Error creating log file: {e}"));
    }

    info!("Task Runner version {VERSION}");
    info!("Parsed configuration: {}", cli.config.display());
    info!("Connecting to {}", config.control_center.server_base_url);
    info!("Token ID: {}", config.control_center.token_id);

    // External shell controllers use the PID file for liveness checks and
    // SIGTERM delivery.
    let pid_file = match PidFile::create(Path::new("db/fabrun.pid")) {
        Ok(pid_file) => pid_file,
        Err(e) => {
            error!("Error writing PID file: {e}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Error creating runtime: {e}");
            return ExitCode::from(2);
        }
    };

    runtime.block_on(async {
        let (queue, queue_task) = RequestQueue::start(&config.control_center);
        let status = RunStatus::new(config.clone(), queue.clone());
        let sync_loop = SyncLoop::new(status, queue, queue_task);
        info!("Entering synchronization loop");
        run_until_terminated(sync_loop).await;
        info!("Exit from synchronization loop");
    });

    drop(pid_file);
    ExitCode::SUCCESS
}

/// Run the sync loop until it exits on its own or SIGTERM arrives.
async fn run_until_terminated(sync_loop: SyncLoop) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sync_loop.main_loop() => {}
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                error!("Cannot install SIGTERM handler: {e}");
                sync_loop.main_loop().await;
            }
        }
    }
    #[cfg(not(unix))]
    sync_loop.main_loop().await;
}

/// Level resolution: CLI flag, then the configuration, then `info`. When a
/// log file is configured the operator log goes to both stdout and the file.
fn init_logging(cli: &Cli, config: &Config) -> std::io::Result<()> {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.generic.log_level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match &config.generic.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_writer(std::io::stdout.and(Arc::new(file)))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn fatal_error(message: &str) -> ExitCode {
    eprintln!("{message}");
    ExitCode::from(2)
}

/// The PID file lives from startup to orderly shutdown.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> std::io::Result<PidFile> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(PidFile {
            path: path.to_owned(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("Error removing PID file: {e}");
        }
    }
}
