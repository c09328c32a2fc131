use thiserror::Error;

use crate::core::bot::BotId;
use crate::core::state::BotState;

/// Exit codes shared by the bot runner and the supervisor.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_UNKNOWN: i32 = 1;
pub const EXIT_CONFIG_INVALID: i32 = 2;
pub const EXIT_AUTHENTICATION_FAILED: i32 = 3;
pub const EXIT_NETWORK_UNAVAILABLE: i32 = 4;
pub const EXIT_SESSION_LOST: i32 = 5;

/// Failures surfaced by a platform adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("session lost: {0}")]
    SessionLost(String),
}

impl AdapterError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AdapterError::ConfigInvalid(_) => EXIT_CONFIG_INVALID,
            AdapterError::AuthenticationFailed(_) => EXIT_AUTHENTICATION_FAILED,
            AdapterError::NetworkUnavailable(_) => EXIT_NETWORK_UNAVAILABLE,
            AdapterError::SessionLost(_) => EXIT_SESSION_LOST,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AdapterError::ConfigInvalid(msg.into())
    }

    pub fn network(err: impl std::fmt::Display) -> Self {
        AdapterError::NetworkUnavailable(err.to_string())
    }
}

/// Why a bot process ended up in the errored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    SpawnFailure(String),
    ConfigInvalid,
    AuthenticationFailed,
    NetworkUnavailable,
    SessionLost,
    ExitCode(i32),
    Signal(i32),
    WaitFailed(String),
}

impl FailureReason {
    /// Maps a non-zero runner exit code back to the adapter failure it encodes.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            EXIT_CONFIG_INVALID => FailureReason::ConfigInvalid,
            EXIT_AUTHENTICATION_FAILED => FailureReason::AuthenticationFailed,
            EXIT_NETWORK_UNAVAILABLE => FailureReason::NetworkUnavailable,
            EXIT_SESSION_LOST => FailureReason::SessionLost,
            other => FailureReason::ExitCode(other),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::SpawnFailure(e) => write!(f, "spawn failure: {}", e),
            FailureReason::ConfigInvalid => write!(f, "configuration invalid"),
            FailureReason::AuthenticationFailed => write!(f, "authentication failed"),
            FailureReason::NetworkUnavailable => write!(f, "network unavailable"),
            FailureReason::SessionLost => write!(f, "platform session lost"),
            FailureReason::ExitCode(code) => write!(f, "exited with code {}", code),
            FailureReason::Signal(sig) => write!(f, "terminated by signal {}", sig),
            FailureReason::WaitFailed(e) => write!(f, "wait failed: {}", e),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bot not found: {0}")]
    NotFound(BotId),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sealing error: {0}")]
    Seal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("bot {0} is already running")]
    AlreadyRunning(BotId),

    #[error("failed to spawn bot {id}: {reason}")]
    SpawnFailure { id: BotId, reason: String },

    #[error("bot {id} failed during start: {reason}")]
    StartFailed {
        id: BotId,
        reason: FailureReason,
        stderr_tail: Vec<String>,
    },

    #[error("start of bot {0} was cancelled by a stop request")]
    Cancelled(BotId),

    #[error("bot {id} cannot start while {}", .state.as_str())]
    InvalidState { id: BotId, state: BotState },

    #[error("lifecycle task for bot {id} failed: {reason}")]
    TaskFailed { id: BotId, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
