//! Session protocol error types.

use crate::state::SessionStatus;
use flow_types::SessionId;
use thiserror::Error;

/// Session protocol error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// An event was applied to the wrong session state.
    #[error("Event for session {actual} applied to session {expected}")]
    SessionMismatch {
        expected: SessionId,
        actual: SessionId,
    },

    /// The body cannot be sent in the current status.
    #[error("Cannot send {kind} on session {session_id} in status {status:?}")]
    InvalidStatus {
        session_id: SessionId,
        status: SessionStatus,
        kind: &'static str,
    },

    /// A session was opened by something other than a first Init.
    #[error("Session {session_id} cannot be accepted from a {kind} with sequence {sequence}")]
    InvalidInit {
        session_id: SessionId,
        kind: &'static str,
        sequence: u64,
    },

    /// Session not found
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// The same session id is held twice by one flow.
    #[error("Session {0} is present more than once")]
    DuplicateSession(SessionId),
}

/// Result type alias using SessionError.
pub type SessionResult<T> = Result<T, SessionError>;
