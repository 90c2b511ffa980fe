//! someipyd: the SOME/IP middleware daemon.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use someipyd::config::Config;
use someipyd::daemon::Daemon;

#[derive(Debug, Parser)]
#[command(name = "someipyd", about = "SOME/IP middleware daemon", version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match &cfg.log_path {
        Some(path) => {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false)
                        .init();
                }
                Err(err) => {
                    tracing_subscriber::fmt().with_env_filter(filter).init();
                    error!(path = %path.display(), %err, "log file unavailable, using stderr");
                }
            }
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match args.config {
        Some(path) => match Config::load(&path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("someipyd: {err}");
                return ExitCode::from(1);
            }
        },
        None => Config::default(),
    };
    init_tracing(&cfg);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("someipyd: failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async move {
        let mut daemon = match Daemon::bind(cfg).await {
            Ok(daemon) => daemon,
            Err(err) => {
                error!(%err, "startup failed");
                eprintln!("someipyd: {err}");
                return ExitCode::from(1);
            }
        };

        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(%err, "cannot install SIGINT handler");
                return ExitCode::from(1);
            }
        };
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(%err, "cannot install SIGTERM handler");
                return ExitCode::from(1);
            }
        };

        let code = tokio::select! {
            result = daemon.run() => match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!(%err, "daemon loop failed");
                    ExitCode::from(1)
                }
            },
            _ = sigint.recv() => {
                info!("SIGINT, shutting down");
                ExitCode::SUCCESS
            }
            _ = sigterm.recv() => {
                info!("SIGTERM, shutting down");
                ExitCode::SUCCESS
            }
        };

        daemon.shutdown().await;
        code
    })
}
