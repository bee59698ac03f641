//! # external-outbox
//!
//! Reliable calls from a suspended flow to an external subsystem (signing,
//! persistence, database access).
//!
//! A flow records an [`OutboxRequest`] in its checkpoint before the request
//! is published. The request is resent every resend window until a response
//! with the same request id arrives. Responses for other ids, and repeated
//! responses, leave the request untouched, so the subsystem may process a
//! request more than once but the flow resumes exactly once.
//!
//! One generic implementation serves every [`ExternalCategory`]; the request
//! and response types are parameters.
//!
//! [`ExternalCategory`]: flow_types::ExternalCategory

mod error;
mod processor;
mod request;

pub use error::{OutboxError, OutboxResult};
pub use processor::OutboxProcessor;
pub use request::{OutboxRequest, OutboxResponse};
