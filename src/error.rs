use std::path::PathBuf;

use crate::pipeline::CommandFailure;

#[derive(Debug, thiserror::Error)]
pub enum GitwardenError {
    #[error("{0}")]
    Command(Box<CommandFailure>),

    #[error("no execution host available: {reason}")]
    HostUnavailable { reason: String },

    #[error("execution host protocol error: {reason}")]
    HostProtocol { reason: String },

    #[error("queued task was dropped before it settled")]
    TaskAborted,

    #[error("credential prompt rejected: {reason}")]
    PromptRejected { reason: String },

    #[error("credential prompt was cancelled")]
    PromptCancelled,

    #[error("ipc error: {reason}")]
    Ipc { reason: String },

    #[error("socket not found at {path}")]
    SocketNotFound { path: PathBuf },

    #[error("credential prompt timeout after {timeout_secs}s")]
    PromptTimeout { timeout_secs: u64 },

    #[error("config parse error in {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GitwardenError {
    /// The failed invocation, if this error came from the external tool itself.
    pub fn command_failure(&self) -> Option<&CommandFailure> {
        match self {
            Self::Command(failure) => Some(&**failure),
            _ => None,
        }
    }
}

impl From<CommandFailure> for GitwardenError {
    fn from(failure: CommandFailure) -> Self {
        Self::Command(Box::new(failure))
    }
}

pub type Result<T> = std::result::Result<T, GitwardenError>;
