use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tlswrapd::{Config, Error, Supervisor};

/// Accept plain TCP connections and tunnel each one to a TLS backend.
#[derive(Debug, Parser)]
#[command(name = "tlswrapd", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(Error::Config(errs)) => {
            for e in errs.iter() {
                eprintln!("config error: {e}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("fatal: {}: {e}", cli.config.display());
            std::process::exit(1);
        }
    };

    init_logging(cli.log_format);
    info!(
        config = %cli.config.display(),
        proxies = config.tunnels.len(),
        "tlswrapd starting"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "tlswrapd exited with error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> tlswrapd::Result<()> {
    // Every listener is bound before any of them accepts.
    let supervisor = match Supervisor::bind(&config.tunnels, &config.settings).await {
        Ok(s) => s,
        Err(errors) => {
            for e in &errors {
                error!(error = %e, "startup failed");
            }
            return Err(errors.into_iter().next().unwrap_or(Error::AllProxiesFailed));
        }
    };

    tokio::select! {
        result = supervisor.run() => result?,
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping...");
        }
    }

    info!("tlswrapd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}
