//! Outbound records produced by the flow event pipeline.
//!
//! Records are committed together with the checkpoint and relayed to the bus
//! afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{ExternalCategory, FlowEvent, SessionEvent};
use crate::ids::{FlowId, RequestId};
use crate::payload::Payload;

/// A request sent to an external subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub flow_id: FlowId,
    pub request_id: RequestId,
    pub category: ExternalCategory,
    pub payload: Payload,
    /// 1 for the first transmission, incremented on every resend.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Ask the scheduler to deliver a wakeup to a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledWakeup {
    pub flow_id: FlowId,
    pub fire_at: DateTime<Utc>,
}

/// Externally visible status of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowStatus {
    Running,
    Completed { result: Payload },
    Failed { message: String },
    Killed { reason: String },
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A flow status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatusUpdate {
    pub flow_id: FlowId,
    pub flow_name: String,
    pub status: FlowStatus,
    pub timestamp: DateTime<Utc>,
}

/// An event that could not be processed, kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event: FlowEvent,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// A record emitted by one pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputRecord {
    Session(SessionEvent),
    ExternalRequest(ExternalRequest),
    ScheduleWakeup(ScheduledWakeup),
    FlowStatus(FlowStatusUpdate),
    DeadLetter(DeadLetterRecord),
}

impl OutputRecord {
    /// Bus topic the record is published to.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Session(_) => "flow.session.out",
            Self::ExternalRequest(req) => match req.category {
                ExternalCategory::Crypto => "flow.external.crypto",
                ExternalCategory::Persistence => "flow.external.persistence",
                ExternalCategory::Database => "flow.external.database",
            },
            Self::ScheduleWakeup(_) => "flow.scheduler",
            Self::FlowStatus(_) => "flow.status",
            Self::DeadLetter(_) => "flow.dlq",
        }
    }

    /// Partition key on the destination topic.
    pub fn key(&self) -> String {
        match self {
            Self::Session(event) => format!("{}:{}", event.destination, event.session_id),
            Self::ExternalRequest(req) => req.request_id.to_string(),
            Self::ScheduleWakeup(wakeup) => wakeup.flow_id.to_string(),
            Self::FlowStatus(status) => status.flow_id.to_string(),
            Self::DeadLetter(record) => record.event.flow_id.to_string(),
        }
    }
}
