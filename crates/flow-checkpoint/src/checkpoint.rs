//! The persisted state of one flow.

use chrono::{DateTime, Utc};
use external_outbox::OutboxRequest;
use flow_types::{ExternalCategory, ExternalOutcome, FlowId, Party, Payload, RequestId, SessionId};
use serde::{Deserialize, Serialize};
use session_protocol::{ensure_unique, lookup, SessionLookup, SessionResult, SessionState};
use std::collections::BTreeMap;

use crate::error::{CheckpointError, CheckpointResult};

/// What an external subsystem answered.
pub type ExternalReply = ExternalOutcome;

/// An outstanding external request as held in a checkpoint.
pub type PendingRequest = OutboxRequest<Payload, ExternalReply>;

/// Final result of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlowResult {
    Success { payload: Payload },
    Failure { message: String },
}

/// What the flow is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuspensionPoint {
    /// The next in-order message on a session.
    AwaitingSession { session_id: SessionId },
    /// The response to an outbox request.
    AwaitingExternal {
        category: ExternalCategory,
        request_id: RequestId,
    },
    /// A point in time.
    AwaitingTimer { at: DateTime<Utc> },
    /// Finished; sessions are still draining.
    Done { result: FlowResult },
}

/// Resumable state owned by the flow logic.
///
/// The counters make identifiers deterministic: re-running the same step
/// after a rollback derives the same session and request ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FiberState {
    #[serde(default)]
    pub user_state: serde_json::Value,
    pub sessions_opened: u64,
    pub requests_issued: u64,
}

impl FiberState {
    pub fn next_session_id(&mut self, flow_id: &FlowId) -> SessionId {
        self.sessions_opened += 1;
        SessionId::for_flow(flow_id, self.sessions_opened)
    }

    pub fn next_request_id(&mut self, flow_id: &FlowId) -> RequestId {
        self.requests_issued += 1;
        RequestId::for_flow(flow_id, self.requests_issued)
    }
}

/// Everything needed to resume a flow after any event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCheckpoint {
    pub flow_id: FlowId,
    pub flow_name: String,
    /// The party the flow runs as.
    pub identity: Party,
    pub suspension: Option<SuspensionPoint>,
    pub sessions: Vec<SessionState>,
    /// At most one outstanding request per category.
    pub pending_requests: BTreeMap<ExternalCategory, PendingRequest>,
    pub fiber: FiberState,
    pub retry_count: u32,
    pub in_retry: bool,
    /// Maintained by the store.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowCheckpoint {
    pub fn new(flow_id: FlowId, flow_name: impl Into<String>, identity: Party, now: DateTime<Utc>) -> Self {
        Self {
            flow_id,
            flow_name: flow_name.into(),
            identity,
            suspension: None,
            sessions: Vec::new(),
            pending_requests: BTreeMap::new(),
            fiber: FiberState::default(),
            retry_count: 0,
            in_retry: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn session(&self, session_id: &SessionId) -> SessionResult<SessionLookup<'_>> {
        lookup(&self.sessions, session_id)
    }

    /// Whether the flow logic has run at least once.
    ///
    /// A checkpoint that has not started only carries retry bookkeeping for
    /// a first event that failed transiently.
    pub fn has_started(&self) -> bool {
        self.suspension.is_some()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.suspension, Some(SuspensionPoint::Done { .. }))
    }

    /// Whether any session still needs traffic before the flow can be removed.
    pub fn has_open_sessions(&self) -> bool {
        self.sessions.iter().any(|s| s.status.is_open())
    }

    /// Checks the structural invariants of the checkpoint.
    pub fn validate(&self) -> CheckpointResult<()> {
        ensure_unique(&self.sessions)?;

        match &self.suspension {
            Some(SuspensionPoint::AwaitingSession { session_id }) => {
                if self.session(session_id)? == SessionLookup::NotFound {
                    return Err(CheckpointError::MissingSession(session_id.clone()));
                }
            }
            Some(SuspensionPoint::AwaitingExternal { category, request_id }) => {
                let held = self
                    .pending_requests
                    .get(category)
                    .is_some_and(|req| &req.request_id == request_id);
                if !held {
                    return Err(CheckpointError::MissingRequest {
                        category: *category,
                        request_id: request_id.clone(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use external_outbox::OutboxProcessor;
    use session_protocol::SessionManager;
    use std::time::Duration;

    fn checkpoint() -> FlowCheckpoint {
        FlowCheckpoint::new(FlowId::from("f1"), "payment", Party::from("alice"), Utc::now())
    }

    #[test]
    fn ids_are_derived_from_counters() {
        let mut cp = checkpoint();
        let first = cp.fiber.next_session_id(&cp.flow_id);
        let request = cp.fiber.next_request_id(&cp.flow_id);
        assert_eq!(first.as_str(), "f1-session-1");
        assert_eq!(request.as_str(), "f1-request-1");

        let mut replay = checkpoint();
        assert_eq!(replay.fiber.next_session_id(&replay.flow_id), first);
    }

    #[test]
    fn suspension_on_missing_session_is_invalid() {
        let mut cp = checkpoint();
        cp.suspension = Some(SuspensionPoint::AwaitingSession {
            session_id: SessionId::from("nope"),
        });
        assert_eq!(cp.validate(), Err(CheckpointError::MissingSession(SessionId::from("nope"))));
    }

    #[test]
    fn suspension_on_held_request_is_valid() {
        let mut cp = checkpoint();
        let req = OutboxProcessor::new().process_message_to_send(
            RequestId::from("r1"),
            ExternalCategory::Crypto,
            Payload::from("tx"),
            Utc::now(),
            Duration::from_secs(1),
        );
        cp.pending_requests.insert(ExternalCategory::Crypto, req);
        cp.suspension = Some(SuspensionPoint::AwaitingExternal {
            category: ExternalCategory::Crypto,
            request_id: RequestId::from("r1"),
        });
        assert!(cp.validate().is_ok());

        cp.suspension = Some(SuspensionPoint::AwaitingExternal {
            category: ExternalCategory::Crypto,
            request_id: RequestId::from("r2"),
        });
        assert!(matches!(cp.validate(), Err(CheckpointError::MissingRequest { .. })));
    }

    #[test]
    fn duplicate_sessions_are_invalid() {
        let mut cp = checkpoint();
        let (session, _) = SessionManager::new().initiate(
            SessionId::from("s"),
            Party::from("alice"),
            Party::from("bob"),
            "p",
            Payload::empty(),
            Utc::now(),
        );
        cp.sessions = vec![session.clone(), session];
        assert!(matches!(cp.validate(), Err(CheckpointError::Session(_))));
    }
}
