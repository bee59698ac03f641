//! The session manager.
//!
//! Operations take a [`SessionState`] by value and return the next value.
//! The manager holds no state of its own; everything lives in the flow's
//! checkpoint.

use chrono::{DateTime, Utc};
use flow_types::{deadline, MessageDirection, Party, Payload, SessionBody, SessionEvent, SessionId};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::state::{PendingSend, ReceiveState, SendState, SessionState, SessionStatus};

/// Stateless implementation of the session protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionManager;

impl SessionManager {
    pub fn new() -> Self {
        Self
    }

    /// Opens a session as the initiator.
    ///
    /// Returns the new state and the `Init` message (sequence 1) to transmit.
    pub fn initiate(
        &self,
        session_id: SessionId,
        identity: Party,
        counterparty: Party,
        protocol: impl Into<String>,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> (SessionState, SessionEvent) {
        let protocol = protocol.into();
        let state = SessionState {
            session_id,
            identity,
            counterparty,
            is_initiator: true,
            protocol: protocol.clone(),
            status: SessionStatus::Created,
            send: SendState::default(),
            receive: ReceiveState::default(),
            error_notice: None,
        };
        push_outgoing(state, SessionBody::Init { protocol, payload }, now)
    }

    /// Accepts a session opened by a counterparty.
    ///
    /// The `Init` stays buffered so the responder flow can consume its payload.
    /// Returns the new state and the `Confirm` message (sequence 1) to transmit.
    pub fn accept(
        &self,
        init: &SessionEvent,
        identity: Party,
        now: DateTime<Utc>,
    ) -> SessionResult<(SessionState, SessionEvent)> {
        let protocol = match &init.body {
            SessionBody::Init { protocol, .. } if init.sequence_num == 1 => protocol.clone(),
            other => {
                return Err(SessionError::InvalidInit {
                    session_id: init.session_id.clone(),
                    kind: other.kind(),
                    sequence: init.sequence_num,
                })
            }
        };

        let mut receive = ReceiveState {
            last_contiguous: 1,
            ack_pending: true,
            ..ReceiveState::default()
        };
        receive.buffer.insert(1, init.clone().into_inbound());

        let state = SessionState {
            session_id: init.session_id.clone(),
            identity,
            counterparty: init.source.clone(),
            is_initiator: false,
            protocol,
            status: SessionStatus::Confirmed,
            send: SendState::default(),
            receive,
            error_notice: None,
        };
        Ok(push_outgoing(state, SessionBody::Confirm, now))
    }

    /// Applies a message received from the counterparty.
    ///
    /// Piggybacked acknowledgements are applied first. In-order messages
    /// advance the contiguous position, messages beyond a gap are held, and
    /// anything at or below the contiguous position is a duplicate and
    /// discarded.
    pub fn process_message_received(
        &self,
        state: SessionState,
        event: &SessionEvent,
    ) -> SessionResult<SessionState> {
        if event.session_id != state.session_id {
            return Err(SessionError::SessionMismatch {
                expected: state.session_id,
                actual: event.session_id.clone(),
            });
        }

        let mut state = apply_acks(state, event.received_sequence, &event.out_of_order_sequences);
        if !event.body.is_sequenced() {
            return Ok(maybe_close(state));
        }

        let seq = event.sequence_num;
        if seq <= state.receive.last_contiguous || state.receive.buffer.contains_key(&seq) {
            debug!(
                session_id = %state.session_id,
                sequence = seq,
                "Discarding duplicate session message"
            );
            // The peer may have missed our ack.
            state.receive.ack_pending = true;
            return Ok(state);
        }

        if matches!(event.body, SessionBody::Data { .. }) && data_after_close(&state, seq) {
            warn!(
                session_id = %state.session_id,
                sequence = seq,
                status = ?state.status,
                "Data received after close"
            );
            if state.status != SessionStatus::Error {
                state.status = SessionStatus::Error;
                state.error_notice = Some(format!("data message {} received after close", seq));
            }
            state.receive.ack_pending = true;
            return Ok(state);
        }

        let receive = &mut state.receive;
        receive.buffer.insert(seq, event.clone().into_inbound());
        if seq == receive.last_contiguous + 1 {
            receive.last_contiguous = seq;
            while receive.out_of_order.remove(&(receive.last_contiguous + 1)) {
                receive.last_contiguous += 1;
            }
        } else {
            receive.out_of_order.insert(seq);
        }
        receive.ack_pending = true;

        match &event.body {
            SessionBody::Confirm if state.status == SessionStatus::Created => {
                state.status = SessionStatus::Confirmed;
            }
            SessionBody::Error { message } => {
                debug!(session_id = %state.session_id, error = %message, "Counterparty reported session error");
                state.status = SessionStatus::Error;
            }
            _ => {}
        }

        Ok(maybe_close(state))
    }

    /// The next message ready for the flow, if it has arrived in order.
    pub fn get_next_received_event<'a>(&self, state: &'a SessionState) -> Option<&'a SessionEvent> {
        let next = state.receive.delivered_up_to + 1;
        if next > state.receive.last_contiguous {
            return None;
        }
        state.receive.buffer.get(&next)
    }

    /// Marks the message with sequence `seq` as consumed by the flow.
    ///
    /// Acknowledging anything other than the next deliverable message leaves
    /// the state unchanged.
    pub fn acknowledge_received_event(&self, mut state: SessionState, seq: u64) -> SessionState {
        let receive = &mut state.receive;
        if seq != receive.delivered_up_to + 1 || seq > receive.last_contiguous {
            return state;
        }
        let Some(event) = receive.buffer.remove(&seq) else {
            return state;
        };
        receive.delivered_up_to = seq;

        if matches!(event.body, SessionBody::Close) {
            receive.close_received = true;
            if matches!(state.status, SessionStatus::Created | SessionStatus::Confirmed) {
                state.status = SessionStatus::Closing;
            }
        }
        maybe_close(state)
    }

    /// Queues a message for the counterparty.
    ///
    /// The message gets the next sequence number and carries the current
    /// acknowledgements. It stays unacknowledged until the peer acks it.
    pub fn process_message_to_send(
        &self,
        state: SessionState,
        body: SessionBody,
        now: DateTime<Utc>,
    ) -> SessionResult<(SessionState, SessionEvent)> {
        let allowed = match &body {
            SessionBody::Data { .. } => matches!(
                state.status,
                SessionStatus::Created | SessionStatus::Confirmed
            ) && !state.send.close_sent,
            SessionBody::Close => state.status != SessionStatus::Closed && !state.send.close_sent,
            SessionBody::Error { .. } => state.status != SessionStatus::Closed,
            SessionBody::Ack => true,
            SessionBody::Init { .. } | SessionBody::Confirm => false,
        };
        if !allowed {
            return Err(SessionError::InvalidStatus {
                session_id: state.session_id,
                status: state.status,
                kind: body.kind(),
            });
        }

        if matches!(body, SessionBody::Ack) {
            let mut state = state;
            let ack = ack_event(&state, now);
            state.receive.ack_pending = false;
            return Ok((state, ack));
        }

        let (mut state, event) = match body {
            SessionBody::Close => {
                let (mut state, event) = push_outgoing(state, SessionBody::Close, now);
                state.send.close_sent = true;
                if matches!(state.status, SessionStatus::Created | SessionStatus::Confirmed) {
                    state.status = SessionStatus::Closing;
                }
                (state, event)
            }
            SessionBody::Error { message } => {
                let (mut state, event) = push_outgoing(state, SessionBody::Error { message }, now);
                state.status = SessionStatus::Error;
                state.error_notice = None;
                (state, event)
            }
            body => push_outgoing(state, body, now),
        };
        state = maybe_close(state);
        Ok((state, event))
    }

    /// Messages due for (re)transmission.
    ///
    /// Every unacknowledged message whose resend window has elapsed is
    /// returned with its original sequence number and refreshed acks. If
    /// nothing is due but an ack is owed, a standalone `Ack` is produced.
    pub fn get_messages_to_send(
        &self,
        mut state: SessionState,
        now: DateTime<Utc>,
        resend_window: Duration,
    ) -> (SessionState, Vec<SessionEvent>) {
        let received_sequence = state.receive.last_contiguous;
        let out_of_order: Vec<u64> = state.receive.out_of_order.iter().copied().collect();

        let mut due = Vec::new();
        for pending in state.send.unacknowledged.iter_mut() {
            if now >= deadline(pending.last_sent, resend_window) {
                pending.last_sent = now;
                pending.event.received_sequence = received_sequence;
                pending.event.out_of_order_sequences = out_of_order.clone();
                pending.event.timestamp = now;
                due.push(pending.event.clone());
            }
        }

        if due.is_empty() && state.receive.ack_pending {
            due.push(ack_event(&state, now));
        }
        if !due.is_empty() {
            state.receive.ack_pending = false;
        }
        (state, due)
    }

    /// Earliest time an unacknowledged message becomes due for resend.
    pub fn next_resend_at(&self, state: &SessionState, resend_window: Duration) -> Option<DateTime<Utc>> {
        state
            .send
            .unacknowledged
            .iter()
            .map(|pending| deadline(pending.last_sent, resend_window))
            .min()
    }
}

/// Builds a sequenced message and records it as unacknowledged.
fn push_outgoing(mut state: SessionState, body: SessionBody, now: DateTime<Utc>) -> (SessionState, SessionEvent) {
    let event = SessionEvent {
        session_id: state.session_id.clone(),
        source: state.identity.clone(),
        destination: state.counterparty.clone(),
        direction: MessageDirection::Outbound,
        sequence_num: state.send.next_sequence,
        received_sequence: state.receive.last_contiguous,
        out_of_order_sequences: state.receive.out_of_order.iter().copied().collect(),
        body,
        timestamp: now,
    };
    state.send.next_sequence += 1;
    state.send.unacknowledged.push(PendingSend {
        event: event.clone(),
        last_sent: now,
    });
    state.receive.ack_pending = false;
    (state, event)
}

fn ack_event(state: &SessionState, now: DateTime<Utc>) -> SessionEvent {
    SessionEvent {
        session_id: state.session_id.clone(),
        source: state.identity.clone(),
        destination: state.counterparty.clone(),
        direction: MessageDirection::Outbound,
        sequence_num: 0,
        received_sequence: state.receive.last_contiguous,
        out_of_order_sequences: state.receive.out_of_order.iter().copied().collect(),
        body: SessionBody::Ack,
        timestamp: now,
    }
}

fn apply_acks(mut state: SessionState, received_sequence: u64, out_of_order: &[u64]) -> SessionState {
    state
        .send
        .unacknowledged
        .retain(|p| p.event.sequence_num > received_sequence && !out_of_order.contains(&p.event.sequence_num));
    state
}

/// Whether a data message with `seq` arrives on a closing or closed session.
///
/// A closing session only accepts the counterparty's own close and acks.
fn data_after_close(state: &SessionState, seq: u64) -> bool {
    if !matches!(state.status, SessionStatus::Created | SessionStatus::Confirmed) || state.receive.close_received {
        return true;
    }
    state
        .receive
        .buffer
        .range(..seq)
        .any(|(_, event)| matches!(event.body, SessionBody::Close))
}

fn maybe_close(mut state: SessionState) -> SessionState {
    if state.status != SessionStatus::Error
        && state.send.close_sent
        && state.receive.close_received
        && state.send.unacknowledged.is_empty()
        && state.receive.buffer.is_empty()
    {
        state.status = SessionStatus::Closed;
    }
    state
}
