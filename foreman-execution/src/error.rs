//! Error types for command dispatch

use std::time::Duration;

use foreman_ipc::{IpcError, WorkerCategory};
use thiserror::Error;

/// Result alias for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Everything that can go wrong between a caller and a worker process.
///
/// Each variant tells the caller something different: the command was never
/// sent, the worker never answered, the worker died, or the worker answered
/// with a failure of its own.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// Payload or response could not be converted; nothing reached the process
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A response line for this command was unreadable
    #[error("Protocol error from '{category}' worker: {message}")]
    Protocol {
        category: WorkerCategory,
        message: String,
    },

    /// No live process for the category and none could be started
    #[error("Worker '{category}' unavailable: {reason}")]
    WorkerUnavailable {
        category: WorkerCategory,
        reason: String,
    },

    /// No response arrived in time. The worker itself is left running.
    #[error("Command '{command}' on '{category}' worker timed out after {timeout:?}")]
    Timeout {
        category: WorkerCategory,
        command: String,
        timeout: Duration,
    },

    /// The process exited or was killed while the command was outstanding
    #[error("Worker '{category}' crashed: {detail}")]
    WorkerCrashed {
        category: WorkerCategory,
        detail: String,
    },

    /// The worker answered with `success: false`
    #[error("Worker '{category}' failed command '{command}': {message}")]
    WorkerReported {
        category: WorkerCategory,
        command: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    pub(crate) fn unavailable(category: &WorkerCategory, reason: impl Into<String>) -> Self {
        DispatchError::WorkerUnavailable {
            category: category.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn crashed(category: &WorkerCategory, detail: impl Into<String>) -> Self {
        DispatchError::WorkerCrashed {
            category: category.clone(),
            detail: detail.into(),
        }
    }

    /// Whether the worker process died underneath the command
    pub fn is_crash(&self) -> bool {
        matches!(self, DispatchError::WorkerCrashed { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout { .. })
    }

    /// Category the error concerns, when there is one
    pub fn category(&self) -> Option<&WorkerCategory> {
        match self {
            DispatchError::Protocol { category, .. }
            | DispatchError::WorkerUnavailable { category, .. }
            | DispatchError::Timeout { category, .. }
            | DispatchError::WorkerCrashed { category, .. }
            | DispatchError::WorkerReported { category, .. } => Some(category),
            DispatchError::Serialization(_) | DispatchError::Config(_) => None,
        }
    }
}

impl DispatchError {
    /// Classify a codec or transport failure on the way to `category`'s worker
    pub fn from_ipc(category: &WorkerCategory, err: IpcError) -> Self {
        match err {
            IpcError::Serialization(message) => DispatchError::Serialization(message),
            IpcError::Protocol(e) => DispatchError::Protocol {
                category: category.clone(),
                message: e.to_string(),
            },
            IpcError::InvalidCategory(name) => DispatchError::Protocol {
                category: category.clone(),
                message: format!("invalid worker category '{name}'"),
            },
            IpcError::ConnectionClosed => Self::unavailable(category, "worker pipe closed"),
            IpcError::Io(message) => Self::unavailable(category, message),
        }
    }
}

impl From<foreman_config::ConfigError> for DispatchError {
    fn from(err: foreman_config::ConfigError) -> Self {
        DispatchError::Config(err.to_string())
    }
}
