use thiserror::Error;

/// Errors produced by the ptyhub session layer.
///
/// Ordinary adverse conditions (unknown session id, process already gone,
/// garbage control frames) are not errors; they surface as `false`/`None`
/// from the session operations. This enum covers the rest.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("max sessions ({0}) reached")]
    LimitReached(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Codec(e.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;
