//! # session-protocol
//!
//! Ordered, acknowledged sessions between two flows on different parties.
//!
//! Each direction of a session numbers its messages from 1. Every message
//! carries the sender's receive position, so acknowledgements travel for
//! free on ordinary traffic. A standalone `Ack` is only produced when
//! nothing else is going out.
//!
//! ```text
//! initiator                         responder
//!   Init(1)        ─────────────▶    accept: buffer Init, Confirmed
//!                  ◀─────────────    Confirm(1) acks 1
//!   Data(2)        ─────────────▶    buffer, deliver in order
//!   Close(3)       ─────────────▶    Closing
//!                  ◀─────────────    Close(2) acks 3
//!   Closed         ─── Ack ─────▶    Closed
//! ```
//!
//! The [`SessionManager`] is stateless. All state lives in [`SessionState`],
//! which the flow checkpoint persists.

mod error;
mod manager;
pub mod state;

#[cfg(test)]
mod tests;

pub use error::{SessionError, SessionResult};
pub use manager::SessionManager;
pub use state::{
    ensure_unique, lookup, position, PendingSend, ReceiveState, SendState, SessionLookup,
    SessionState, SessionStatus,
};
