//! Outbox state transitions.

use chrono::{DateTime, Utc};
use flow_types::{deadline, ExternalCategory, RequestId};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;

use crate::error::{OutboxError, OutboxResult};
use crate::request::{OutboxRequest, OutboxResponse};

/// Stateless processor for outbox requests carrying `Req` and resolved by `Resp`.
#[derive(Debug)]
pub struct OutboxProcessor<Req, Resp> {
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Default for OutboxProcessor<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> Clone for OutboxProcessor<Req, Resp> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<Req, Resp> Copy for OutboxProcessor<Req, Resp> {}

impl<Req, Resp> OutboxProcessor<Req, Resp> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<Req: Clone, Resp> OutboxProcessor<Req, Resp> {
    /// Fails if `pending` still holds an unresolved request.
    pub fn ensure_available(
        &self,
        category: ExternalCategory,
        pending: Option<&OutboxRequest<Req, Resp>>,
    ) -> OutboxResult<()> {
        match pending {
            Some(existing) if !existing.is_resolved() => Err(OutboxError::CategoryBusy {
                category,
                pending: existing.request_id.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Records a new request as sent at `now`.
    pub fn process_message_to_send(
        &self,
        request_id: RequestId,
        category: ExternalCategory,
        request: Req,
        now: DateTime<Utc>,
        resend_window: Duration,
    ) -> OutboxRequest<Req, Resp> {
        OutboxRequest {
            request_id,
            category,
            request,
            response: None,
            sent_at: now,
            resend_window,
            attempts: 1,
        }
    }

    /// Attaches a response.
    ///
    /// Responses for a different request id, and any response after the
    /// first, leave the request unchanged.
    pub fn process_message_received(
        &self,
        mut req: OutboxRequest<Req, Resp>,
        response: OutboxResponse<Resp>,
    ) -> OutboxRequest<Req, Resp> {
        if response.request_id != req.request_id {
            debug!(
                expected = %req.request_id,
                actual = %response.request_id,
                "Ignoring response for a different request"
            );
            return req;
        }
        if req.is_resolved() {
            debug!(request_id = %req.request_id, "Ignoring duplicate response");
            return req;
        }
        req.response = Some(response.payload);
        req
    }

    /// Returns the request for retransmission once its window has elapsed.
    ///
    /// A request is due at `sent_at + resend_window`. A resend sets
    /// `sent_at = now`, so the next one falls due a full window later.
    /// Resolved and not-yet-due requests come back unchanged.
    pub fn get_message_to_send(
        &self,
        mut req: OutboxRequest<Req, Resp>,
        now: DateTime<Utc>,
        resend_window: Duration,
    ) -> (OutboxRequest<Req, Resp>, Option<Req>) {
        if req.is_resolved() || now < deadline(req.sent_at, resend_window) {
            return (req, None);
        }
        req.resend_window = resend_window;
        req.sent_at = now;
        req.attempts += 1;
        let request = req.request.clone();
        (req, Some(request))
    }

    /// Returns the request for immediate retransmission, regardless of the window.
    ///
    /// Used when the subsystem reports a retriable failure.
    pub fn force_resend(
        &self,
        mut req: OutboxRequest<Req, Resp>,
        now: DateTime<Utc>,
    ) -> (OutboxRequest<Req, Resp>, Req) {
        req.response = None;
        req.sent_at = now;
        req.attempts += 1;
        let request = req.request.clone();
        (req, request)
    }

    /// When the request is next due for resend.
    pub fn next_resend_at(&self, req: &OutboxRequest<Req, Resp>) -> Option<DateTime<Utc>> {
        req.due_at()
    }
}
