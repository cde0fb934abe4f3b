//! Server configuration: TOML file + CLI overrides.

use crate::session::{ReplayLimits, SessionConfig};
use ptyhub_core::{HubError, HubResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_max_replay_burst")]
    pub max_replay_burst: u64,
    #[serde(default = "default_replay_chunk_size")]
    pub replay_chunk_size: usize,
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default)]
    pub shell: Option<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            max_replay_burst: default_max_replay_burst(),
            replay_chunk_size: default_replay_chunk_size(),
            idle_threshold_ms: default_idle_threshold_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            shell: None,
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}
fn default_port() -> u16 {
    7681
}
fn default_max_sessions() -> usize {
    64
}
fn default_ring_capacity() -> usize {
    2 * 1024 * 1024
}
fn default_max_replay_burst() -> u64 {
    128 * 1024
}
fn default_replay_chunk_size() -> usize {
    64 * 1024
}
fn default_idle_threshold_ms() -> u64 {
    5000
}
fn default_kill_grace_ms() -> u64 {
    200
}

/// Values given on the command line; each overrides the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub idle_threshold_ms: Option<u64>,
    pub shell: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub session: SessionConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> HubResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    /// Merge CLI overrides into a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> HubResult<Self> {
        let server = file.server;
        let session = file.session;

        let max_sessions = cli.max_sessions.unwrap_or(server.max_sessions);
        if max_sessions == 0 {
            return Err(HubError::Config("max_sessions must be at least 1".into()));
        }
        if session.ring_capacity == 0 {
            return Err(HubError::Config("ring_capacity must be non-zero".into()));
        }
        if session.max_replay_burst == 0 {
            return Err(HubError::Config("max_replay_burst must be non-zero".into()));
        }
        if session.replay_chunk_size == 0 {
            return Err(HubError::Config("replay_chunk_size must be non-zero".into()));
        }

        let listen = SocketAddr::new(
            cli.bind.unwrap_or(server.bind),
            cli.port.unwrap_or(server.port),
        );

        Ok(Self {
            listen,
            session: SessionConfig {
                max_sessions,
                ring_capacity: session.ring_capacity,
                replay: ReplayLimits {
                    max_burst: session.max_replay_burst,
                    chunk_size: session.replay_chunk_size,
                },
                idle_threshold: Duration::from_millis(
                    cli.idle_threshold_ms.unwrap_or(session.idle_threshold_ms),
                ),
                kill_grace: Duration::from_millis(session.kill_grace_ms),
                shell: cli.shell.or(session.shell),
            },
        })
    }
}

fn parse(content: &str) -> HubResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| HubError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
