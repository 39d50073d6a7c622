//! Worker-specific error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

use super::protocol::ProtocolError;
use crate::config::SettingsError;
use crate::engine::EngineError;

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors a dispatcher call can fail with.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The worker channel failed while this call was in flight.
    #[error("worker channel failed, falling back to in-process execution: {0}")]
    ChannelFailed(String),

    /// The worker answered with an error response.
    #[error("{0}")]
    Remote(String),

    /// The in-process engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Neither the worker nor the in-process engine could be started.
    #[error("search engine unavailable: {0}")]
    Unavailable(String),

    /// No channel to send on.
    #[error("worker not initialized")]
    NotInitialized,

    /// The data handle belonged to a worker that is gone.
    #[error("data handle {0} is no longer available")]
    DataUnavailable(String),

    /// The dispatcher was torn down.
    #[error("dispatcher has been destroyed")]
    Destroyed,

    /// A worker call exceeded the configured call timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to encode a request.
    #[error("failed to serialize request: {0}")]
    Serialize(#[source] ProtocolError),

    /// Failed to decode a worker result.
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[source] serde_json::Error),
}

impl DispatchError {
    /// Check if this error came from a dead channel rather than the call itself.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, Self::ChannelFailed(_) | Self::NotInitialized)
    }

    /// Check if retrying the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ChannelFailed(_) | Self::Timeout(_) | Self::DataUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialize(err)
    }
}

/// Errors starting a worker.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The host environment cannot run workers.
    #[error("worker execution is not supported here")]
    Unsupported,

    /// Failed to spawn the worker process.
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Failed to start the worker thread.
    #[error("failed to start worker thread: {0}")]
    ThreadFailed(#[source] io::Error),

    /// The worker location could not be resolved.
    #[error("invalid worker location: {0}")]
    Location(#[from] SettingsError),
}

/// Errors inside the worker host. Each becomes the `error` of a response.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Search engine not initialized")]
    NotInitialized,

    #[error("Data function {0} not found")]
    DataNotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to serialize result: {0}")]
    Encode(#[from] serde_json::Error),
}
