use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::handle::RequestId;

/// Everything that can go wrong between launching the application and
/// resolving a handle.
///
/// `Clone` so a resolved handle can hand out its cached failure every time
/// `wait()` is called.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("failed to launch {}: {reason}", binary.display())]
    LaunchFailure { binary: PathBuf, reason: String },

    #[error("request {id} timed out after {timeout:?}")]
    RequestTimeout { id: RequestId, timeout: Duration },

    #[error("connection to {addr} failed: {reason}")]
    ConnectionFailure { addr: SocketAddr, reason: String },

    #[error("request {id} was cancelled")]
    Cancelled { id: RequestId },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RunnerError {
    pub(crate) fn launch(binary: impl Into<PathBuf>, reason: impl ToString) -> Self {
        RunnerError::LaunchFailure {
            binary: binary.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<envy::Error> for RunnerError {
    fn from(e: envy::Error) -> Self {
        RunnerError::Config(e.to_string())
    }
}

/// Raised by the response assertion helpers. The message carries the
/// expected/actual mismatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("assertion failed: {message}")]
pub struct AssertionFailure {
    pub message: String,
}

impl AssertionFailure {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
