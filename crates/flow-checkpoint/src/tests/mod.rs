//! Checkpoint store test suites.
//!
//! - `durability.rs` - committed state survives reopening the database
//! - `failures.rs`   - injected failures leave no partial commit
//! - `versioning.rs` - optimistic version checks and termination

mod versioning;

use crate::FlowCheckpoint;
use chrono::Utc;
use flow_types::{FlowId, FlowStatus, FlowStatusUpdate, OutputRecord, Party, ScheduledWakeup};

pub(crate) fn checkpoint(flow: &str) -> FlowCheckpoint {
    FlowCheckpoint::new(FlowId::from(flow), "payment", Party::from("alice"), Utc::now())
}

pub(crate) fn status_output(flow: &str) -> OutputRecord {
    OutputRecord::FlowStatus(FlowStatusUpdate {
        flow_id: FlowId::from(flow),
        flow_name: "payment".into(),
        status: FlowStatus::Running,
        timestamp: Utc::now(),
    })
}

pub(crate) fn wakeup_output(flow: &str) -> OutputRecord {
    OutputRecord::ScheduleWakeup(ScheduledWakeup {
        flow_id: FlowId::from(flow),
        fire_at: Utc::now(),
    })
}
