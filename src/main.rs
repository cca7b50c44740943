mod config;
mod error;
mod io;
mod logging;
mod protocol;
mod proxy;
mod rules;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use config::ProxyConfig;
use error::ProxyError;
use logging::{LogConfig, init_logging};
use proxy::{Proxy, ProxyOutcome};

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// CLI arguments for the codex autopilot proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file (rules, downstream command, timeouts)
    #[arg(long, value_name = "FILE", env = "CODEX_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the codex executable (overrides CODEX_PATH env var)
    #[arg(long, value_name = "PATH")]
    codex_path: Option<String>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides CODEX_PROXY_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Resolve the codex executable from CLI args and environment
///
/// `None` keeps whatever the config file (or the default) names.
fn resolve_codex_path(codex_path_arg: Option<String>) -> Option<String> {
    // Priority: CLI arg > CODEX_PATH env var > config
    codex_path_arg.or_else(|| std::env::var("CODEX_PATH").ok())
}

/// Config file (or defaults), then the executable override, validated together
fn load_config(
    path: Option<&Path>,
    codex_path: Option<String>,
) -> Result<ProxyConfig, ProxyError> {
    let config =
        ProxyConfig::load(path)?.with_command_override(resolve_codex_path(codex_path));
    config.validate()?;
    Ok(config)
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    error!("Failed to listen for SIGTERM: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received SIGINT, shutting down");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
            }
        }
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level, args.log_file);

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = match load_config(args.config.as_deref(), args.codex_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    info!(
        "Starting proxy for `{} {}`",
        config.downstream.command,
        config.downstream.args.join(" ")
    );

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let code = match Proxy::new(config).run(shutdown).await {
        Ok(outcome) => {
            if let ProxyOutcome::Completed {
                exit_code: Some(code),
            } = outcome
                && code != 0
            {
                warn!("Subprocess exited with status {}", code);
            }
            info!("Proxy finished: {:?}", outcome);
            outcome.exit_code()
        }
        Err(e) => {
            error!("Proxy failed: {}", e);
            1
        }
    };

    // The blocking stdin reader would otherwise keep the runtime alive
    std::process::exit(code);
}
