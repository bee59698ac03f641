//! Outbox request and response records.

use chrono::{DateTime, Utc};
use flow_types::{deadline, ExternalCategory, RequestId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An outstanding call to an external subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRequest<Req, Resp> {
    /// Stable across resends.
    pub request_id: RequestId,
    pub category: ExternalCategory,
    pub request: Req,
    pub response: Option<Resp>,
    /// Time of the most recent transmission.
    pub sent_at: DateTime<Utc>,
    pub resend_window: Duration,
    /// Number of transmissions so far.
    pub attempts: u32,
}

impl<Req, Resp> OutboxRequest<Req, Resp> {
    pub fn is_resolved(&self) -> bool {
        self.response.is_some()
    }

    /// When the request next becomes due, if it is still unresolved.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        if self.is_resolved() {
            return None;
        }
        Some(deadline(self.sent_at, self.resend_window))
    }
}

/// A response from an external subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxResponse<Resp> {
    pub request_id: RequestId,
    pub payload: Resp,
}
