//! Session protocol test suites.
//!
//! - `ordering.rs` - delivery order under arbitrary arrival order (proptest)
//! - `exchange.rs` - two sides exchanging over a lossy, duplicating channel


use crate::{SessionManager, SessionState};
use chrono::{DateTime, Utc};
use flow_types::{MessageDirection, Party, Payload, SessionBody, SessionEvent, SessionId};

pub(crate) fn at(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap()
}

/// A data message from bob to alice on session `s-1`.
pub(crate) fn inbound_data(seq: u64) -> SessionEvent {
    SessionEvent {
        session_id: SessionId::from("s-1"),
        source: Party::from("bob"),
        destination: Party::from("alice"),
        direction: MessageDirection::Inbound,
        sequence_num: seq,
        received_sequence: 0,
        out_of_order_sequences: Vec::new(),
        body: SessionBody::Data {
            payload: Payload::from(format!("m{}", seq)),
        },
        timestamp: at(0),
    }
}

/// Alice's freshly initiated side of `s-1`.
pub(crate) fn initiated() -> SessionState {
    SessionManager::new()
        .initiate(
            SessionId::from("s-1"),
            Party::from("alice"),
            Party::from("bob"),
            "test",
            Payload::empty(),
            at(0),
        )
        .0
}

/// Delivers everything that is ready, returning the delivered sequence numbers.
pub(crate) fn deliver_ready(manager: &SessionManager, mut state: SessionState) -> (SessionState, Vec<u64>) {
    let mut delivered = Vec::new();
    while let Some(seq) = manager.get_next_received_event(&state).map(|e| e.sequence_num) {
        delivered.push(seq);
        state = manager.acknowledge_received_event(state, seq);
    }
    (state, delivered)
}
