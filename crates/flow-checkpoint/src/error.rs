//! Checkpoint and store error types.

use flow_types::{ExternalCategory, FlowId, RequestId, SessionId};
use session_protocol::SessionError;
use thiserror::Error;

/// A checkpoint violates one of its structural invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// The flow is suspended on a session it does not hold.
    #[error("Suspended on missing session {0}")]
    MissingSession(SessionId),

    /// The flow is suspended on a request it does not hold.
    #[error("Suspended on missing {category} request {request_id}")]
    MissingRequest {
        category: ExternalCategory,
        request_id: RequestId,
    },

    /// Session list error (duplicate id).
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Checkpoint store error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Another writer committed first.
    #[error("Version conflict for flow {flow_id}: expected {expected}, found {found}")]
    VersionConflict {
        flow_id: FlowId,
        expected: u64,
        found: u64,
    },

    /// The flow already finished and cannot be recreated.
    #[error("Flow {0} has already terminated")]
    Terminated(FlowId),

    #[cfg(test)]
    #[error("Injected failure")]
    Injected,
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;
