//! Error types for the flow pipeline.

use external_outbox::OutboxError;
use flow_checkpoint::{CheckpointError, StoreError};
use session_protocol::SessionError;
use thiserror::Error;

/// A failure raised while applying one event to one flow.
///
/// The exception handler chain turns every variant into a retry, a value
/// the flow logic sees, or a fatal termination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowEventError {
    /// Redeliver the event.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Domain failure raised by the flow logic.
    #[error("Business error: {0}")]
    Business(String),

    /// Invariant violated; the flow cannot continue.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// A platform service failed in a way the flow logic should see.
    #[error("Platform error: {0}")]
    Platform(String),
}

impl From<SessionError> for FlowEventError {
    fn from(err: SessionError) -> Self {
        match err {
            // A send the session's status forbids is a flow logic mistake. Redelivery
            // would replay it against the same session state, so the logic sees it.
            SessionError::InvalidStatus { .. } | SessionError::NotFound(_) => Self::Business(err.to_string()),
            SessionError::DuplicateSession(_) | SessionError::SessionMismatch { .. } | SessionError::InvalidInit { .. } => {
                Self::Fatal(err.to_string())
            }
        }
    }
}

impl From<CheckpointError> for FlowEventError {
    fn from(err: CheckpointError) -> Self {
        Self::Fatal(err.to_string())
    }
}

impl From<OutboxError> for FlowEventError {
    fn from(err: OutboxError) -> Self {
        Self::Fatal(err.to_string())
    }
}

/// Error returned by flow logic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// A domain failure. Delivered back to the logic once, then fails the flow.
    #[error("{0}")]
    Business(String),

    /// A recoverable condition such as a lock held elsewhere. The event is redelivered.
    #[error("{0}")]
    Transient(String),

    /// The flow cannot continue.
    #[error("{0}")]
    Fatal(String),
}

impl FlowError {
    pub fn business(message: impl Into<String>) -> Self {
        Self::Business(message.into())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("flow state encoding: {}", err))
    }
}

impl From<FlowError> for FlowEventError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Business(m) => Self::Business(m),
            FlowError::Transient(m) => Self::Transient(m),
            FlowError::Fatal(m) => Self::Fatal(m),
        }
    }
}

/// Pipeline error type. Only the store can fail a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Checkpoint store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Rejection from an output sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Output relay error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Output log error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The sink refused an output
    #[error("Sink rejected output {id}: {source}")]
    Sink { id: i64, source: SinkError },
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Worker pool error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool no longer accepts events
    #[error("Worker pool is shut down")]
    Closed,
}

/// Configuration error type.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;
    use flow_types::SessionId;
    use session_protocol::SessionStatus;

    #[test]
    fn duplicate_session_is_fatal() {
        let err: FlowEventError = SessionError::DuplicateSession(SessionId::from("s")).into();
        assert!(matches!(err, FlowEventError::Fatal(_)));
    }

    #[test]
    fn send_on_closed_session_is_business() {
        let err: FlowEventError = SessionError::InvalidStatus {
            session_id: SessionId::from("s"),
            status: SessionStatus::Closed,
            kind: "data",
        }
        .into();
        match err {
            FlowEventError::Business(message) => assert!(message.contains("Closed")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_session_is_business() {
        let err: FlowEventError = SessionError::NotFound(SessionId::from("s")).into();
        assert!(matches!(err, FlowEventError::Business(_)));
    }
}
