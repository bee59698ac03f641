//! Outbox error types.

use flow_types::{ExternalCategory, RequestId};
use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// A flow may only wait on one request per category.
    #[error("Request {pending} already outstanding for category {category}")]
    CategoryBusy {
        category: ExternalCategory,
        pending: RequestId,
    },
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
