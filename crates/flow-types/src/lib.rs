//! # flow-types
//!
//! Shared vocabulary for the flow engine crates.
//!
//! Everything that crosses a crate boundary or the message bus lives here:
//!
//! - [`ids`] - string identifiers for flows, sessions, requests and parties
//! - [`payload`] - the opaque [`Payload`] byte container
//! - [`event`] - inbound envelopes consumed by the pipeline
//! - [`output`] - outbound records produced by the pipeline
//! - [`clock`] - wall-clock abstraction with a manual clock for tests
//!
//! The bus collaborator owns the real wire format. These types use serde so
//! the checkpoint store and the in-process loopback bus can persist them as JSON.

pub mod clock;
pub mod event;
pub mod ids;
pub mod output;
pub mod payload;

pub use clock::{deadline, elapsed, Clock, ManualClock, SystemClock};
pub use event::{
    ExternalCategory, ExternalErrorKind, ExternalOutcome, ExternalResponse, FlowEvent,
    FlowEventPayload, KillRequest, MessageDirection, SessionBody, SessionEvent,
    StartFlowRequest, Wakeup,
};
pub use ids::{FlowId, Party, RequestId, SessionId};
pub use output::{
    DeadLetterRecord, ExternalRequest, FlowStatus, FlowStatusUpdate, OutputRecord,
    ScheduledWakeup,
};
pub use payload::Payload;
