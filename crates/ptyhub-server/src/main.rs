//! ptyhub-server: resumable PTY sessions over HTTP and WebSocket.
//!
//! Each session is a shell on a pseudo-terminal whose output is kept in a
//! bounded byte ring. Viewers attach over WebSocket with the last stream
//! offset they saw and receive exactly the bytes they missed, then the
//! live stream.

mod config;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::HubServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// ptyhub-server: resumable terminal sessions
#[derive(Parser, Debug)]
#[command(name = "ptyhub-server", version, about = "Resumable PTY session server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.ptyhub/config.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Output silence (ms) before a session is reported idle
    #[arg(long)]
    idle_threshold_ms: Option<u64>,

    /// Shell to spawn instead of $SHELL
    #[arg(long)]
    shell: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ptyhub-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        max_sessions: cli.max_sessions,
        idle_threshold_ms: cli.idle_threshold_ms,
        shell: cli.shell,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = HubServer::new(server_config).run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("ptyhub-server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
