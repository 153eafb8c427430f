use thiserror::Error;

/// Errors produced by the termhub session engine and its transports.
#[derive(Debug, Error)]
pub enum TermError {
    #[error("session limit reached (max {max})")]
    CapacityExceeded { max: usize },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid working directory: {0}")]
    InvalidTarget(String),

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TermError {
    /// Stable short identifier, for callers that map errors onto responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::SessionNotFound(_) => "not_found",
            Self::InvalidTarget(_) => "invalid_target",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::Protocol(_) => "protocol",
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for TermError {
    fn from(e: serde_json::Error) -> Self {
        TermError::Protocol(e.to_string())
    }
}

pub type TermResult<T> = Result<T, TermError>;
