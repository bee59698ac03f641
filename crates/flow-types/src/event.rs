//! Inbound envelopes consumed by the flow event pipeline.
//!
//! Every inbound unit is keyed by [`FlowId`]. The bus guarantees that all
//! events for one key are consumed by one partition, in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{FlowId, Party, RequestId, SessionId};
use crate::payload::Payload;

/// An event addressed to one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub flow_id: FlowId,
    pub payload: FlowEventPayload,
}

impl FlowEvent {
    pub fn new(flow_id: FlowId, payload: FlowEventPayload) -> Self {
        Self { flow_id, payload }
    }

    /// Short name of the event kind, used in logs and dead-letter reasons.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// The closed set of inbound event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEventPayload {
    /// Start a new flow.
    StartFlow(StartFlowRequest),
    /// A message from a counterparty session.
    Session(SessionEvent),
    /// A response from an external subsystem.
    ExternalResponse(ExternalResponse),
    /// A scheduled wakeup.
    Wakeup(Wakeup),
    /// Operator request to terminate the flow.
    Kill(KillRequest),
}

impl FlowEventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartFlow(_) => "start_flow",
            Self::Session(_) => "session",
            Self::ExternalResponse(_) => "external_response",
            Self::Wakeup(_) => "wakeup",
            Self::Kill(_) => "kill",
        }
    }
}

/// Request to start a flow registered under `flow_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFlowRequest {
    pub flow_name: String,
    /// The party the flow runs as.
    pub identity: Party,
    pub args: Payload,
    pub requested_at: DateTime<Utc>,
}

/// A scheduled wakeup for a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wakeup {
    pub fire_at: DateTime<Utc>,
}

/// Operator kill request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillRequest {
    pub reason: String,
}

// ============================================================================
// Session messages
// ============================================================================

/// Direction of a session message relative to the flow that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    /// Produced by a flow, travelling to the counterparty.
    Outbound,
    /// Delivered from the counterparty to a flow.
    Inbound,
}

/// Body of a session message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionBody {
    /// Opens a session; always sequence number 1 from the initiator.
    Init { protocol: String, payload: Payload },
    /// Confirms an initiation; always sequence number 1 from the responder.
    Confirm,
    /// Application data.
    Data { payload: Payload },
    /// One side will send nothing further.
    Close,
    /// The sending side hit an error on this session.
    Error { message: String },
    /// Standalone acknowledgement. Not sequenced.
    Ack,
}

impl SessionBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Confirm => "confirm",
            Self::Data { .. } => "data",
            Self::Close => "close",
            Self::Error { .. } => "error",
            Self::Ack => "ack",
        }
    }

    /// Whether the body consumes a sequence number.
    pub fn is_sequenced(&self) -> bool {
        !matches!(self, Self::Ack)
    }
}

/// A message on a session between two parties.
///
/// Every message piggybacks the sender's receive position
/// (`received_sequence`, `out_of_order_sequences`), which acknowledges the
/// peer's messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub source: Party,
    pub destination: Party,
    pub direction: MessageDirection,
    /// Sequence number of this message; 0 for unsequenced acks.
    pub sequence_num: u64,
    /// Highest contiguous sequence number the sender has received.
    pub received_sequence: u64,
    /// Sequence numbers the sender holds beyond a gap.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out_of_order_sequences: Vec<u64>,
    pub body: SessionBody,
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    /// The same message as delivered to the destination flow.
    pub fn into_inbound(mut self) -> Self {
        self.direction = MessageDirection::Inbound;
        self
    }
}

// ============================================================================
// External subsystem responses
// ============================================================================

/// Category of external subsystem a flow may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalCategory {
    /// Signing and verification.
    Crypto,
    /// Ledger persistence reads and writes.
    Persistence,
    /// Generic database access.
    Database,
}

impl ExternalCategory {
    pub const ALL: [ExternalCategory; 3] = [Self::Crypto, Self::Persistence, Self::Database];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crypto => "crypto",
            Self::Persistence => "persistence",
            Self::Database => "database",
        }
    }
}

impl std::fmt::Display for ExternalCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an external subsystem failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalErrorKind {
    /// Retry: the request is resent immediately.
    Transient,
    /// The flow logic sees the failure as an error value.
    Platform,
    /// The flow is terminated.
    Fatal,
}

/// Result reported by an external subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExternalOutcome {
    Success { payload: Payload },
    Failure { kind: ExternalErrorKind, message: String },
}

/// A response to an outbox request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub request_id: RequestId,
    pub category: ExternalCategory,
    pub outcome: ExternalOutcome,
    pub timestamp: DateTime<Utc>,
}
