//! Persisted session state.

use chrono::{DateTime, Utc};
use flow_types::{Party, SessionEvent, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{SessionError, SessionResult};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Init sent, Confirm not yet received.
    Created,
    /// Both sides have agreed to talk.
    Confirmed,
    /// One side has closed.
    Closing,
    /// Both sides have closed and everything is acknowledged.
    Closed,
    /// The session failed.
    Error,
}

impl SessionStatus {
    /// Whether the session still needs processing before the flow may finish.
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Closed | Self::Error)
    }
}

/// An outgoing message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSend {
    pub event: SessionEvent,
    pub last_sent: DateTime<Utc>,
}

/// Outgoing half of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendState {
    /// Sequence number the next sequenced message will carry.
    pub next_sequence: u64,
    /// Sent but unacknowledged messages, ascending by sequence number.
    pub unacknowledged: Vec<PendingSend>,
    pub close_sent: bool,
}

impl Default for SendState {
    fn default() -> Self {
        Self {
            next_sequence: 1,
            unacknowledged: Vec::new(),
            close_sent: false,
        }
    }
}

/// Incoming half of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveState {
    /// Highest sequence number up to which everything has been received.
    pub last_contiguous: u64,
    /// Highest sequence number handed to the flow.
    pub delivered_up_to: u64,
    /// Received but undelivered messages, including ones beyond a gap.
    pub buffer: BTreeMap<u64, SessionEvent>,
    /// Sequence numbers held beyond the first gap.
    pub out_of_order: BTreeSet<u64>,
    /// A sequenced message arrived and has not been acknowledged yet.
    pub ack_pending: bool,
    pub close_received: bool,
}

/// Protocol state of one session, owned by one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    /// The party this side acts as.
    pub identity: Party,
    pub counterparty: Party,
    pub is_initiator: bool,
    pub protocol: String,
    pub status: SessionStatus,
    pub send: SendState,
    pub receive: ReceiveState,
    /// Reason for an Error message still owed to the counterparty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_notice: Option<String>,
}

impl SessionState {
    /// Whether a received message is ready for the flow.
    pub fn has_deliverable(&self) -> bool {
        self.receive.delivered_up_to < self.receive.last_contiguous
    }

    /// Whether this side owes the counterparty any transmission.
    pub fn has_pending_transmission(&self) -> bool {
        !self.send.unacknowledged.is_empty() || self.receive.ack_pending
    }
}

/// Outcome of looking a session up in a flow's session list.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionLookup<'a> {
    Found(&'a SessionState),
    NotFound,
}

/// Finds the position of `session_id` in `sessions`.
///
/// A list holding the id more than once is corrupt and reported as
/// [`SessionError::DuplicateSession`].
pub fn position(sessions: &[SessionState], session_id: &SessionId) -> SessionResult<Option<usize>> {
    let mut matches = sessions
        .iter()
        .enumerate()
        .filter(|(_, s)| &s.session_id == session_id)
        .map(|(i, _)| i);

    let first = matches.next();
    if matches.next().is_some() {
        return Err(SessionError::DuplicateSession(session_id.clone()));
    }
    Ok(first)
}

/// Looks `session_id` up in `sessions`.
pub fn lookup<'a>(sessions: &'a [SessionState], session_id: &SessionId) -> SessionResult<SessionLookup<'a>> {
    Ok(match position(sessions, session_id)? {
        Some(i) => SessionLookup::Found(&sessions[i]),
        None => SessionLookup::NotFound,
    })
}

/// Checks that no session id appears twice.
pub fn ensure_unique(sessions: &[SessionState]) -> SessionResult<()> {
    let mut seen = BTreeSet::new();
    for session in sessions {
        if !seen.insert(&session.session_id) {
            return Err(SessionError::DuplicateSession(session.session_id.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> SessionState {
        SessionState {
            session_id: SessionId::from(id),
            identity: Party::from("alice"),
            counterparty: Party::from("bob"),
            is_initiator: true,
            protocol: "ping".into(),
            status: SessionStatus::Created,
            send: SendState::default(),
            receive: ReceiveState::default(),
            error_notice: None,
        }
    }

    #[test]
    fn lookup_finds_single_session() {
        let sessions = vec![session("a"), session("b")];
        assert_eq!(lookup(&sessions, &SessionId::from("b")).unwrap(), SessionLookup::Found(&sessions[1]));
        assert_eq!(lookup(&sessions, &SessionId::from("c")).unwrap(), SessionLookup::NotFound);
    }

    #[test]
    fn duplicate_session_is_an_error() {
        let sessions = vec![session("a"), session("a")];
        assert_eq!(
            lookup(&sessions, &SessionId::from("a")),
            Err(SessionError::DuplicateSession(SessionId::from("a")))
        );
        assert!(ensure_unique(&sessions).is_err());
        assert!(ensure_unique(&sessions[..1]).is_ok());
    }

    #[test]
    fn new_send_state_starts_at_one() {
        assert_eq!(SendState::default().next_sequence, 1);
    }
}
