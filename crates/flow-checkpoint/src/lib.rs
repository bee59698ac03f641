//! # flow-checkpoint
//!
//! The durable state of a flow and the store that commits it.
//!
//! ## Write path
//!
//! ```text
//! load ─▶ pipeline works on a copy ─▶ save(checkpoint | None, outputs)
//!                                       └─ one SQLite transaction
//! relay: pending_outputs ─▶ bus ─▶ mark_delivered
//! ```
//!
//! A redelivered event after a crash sees either the old checkpoint with no
//! outputs, or the new checkpoint with all of its outputs. Never a mix.
//!
//! - [`checkpoint`] - [`FlowCheckpoint`] and its parts
//! - [`store`] - [`CheckpointStore`] and [`OutputLog`] contracts
//! - [`SqliteCheckpointStore`] - the SQLite implementation

pub mod checkpoint;
mod error;
mod sqlite;
pub mod store;

#[cfg(test)]
mod tests;

pub use checkpoint::{ExternalReply, FiberState, FlowCheckpoint, FlowResult, PendingRequest, SuspensionPoint};
pub use error::{CheckpointError, CheckpointResult, StoreError, StoreResult};
pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointStore, LoggedOutput, OutputLog};
