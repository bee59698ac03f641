//! Exception handler chain.
//!
//! Every error raised while processing an event ends up here. Handlers are
//! tried most specific first; the fatal handler accepts anything, so the
//! chain always produces a context the pipeline can commit.

use flow_checkpoint::{FlowCheckpoint, FlowResult};
use flow_types::{DeadLetterRecord, FlowStatus, OutputRecord, SessionBody};
use session_protocol::SessionManager;
use tracing::{error, warn};

use crate::context::{FlowContinuation, FlowEventContext};
use crate::error::FlowEventError;
use crate::fiber::{finish, notify_open_sessions};

/// One link of the chain.
pub trait ExceptionHandler: Send + Sync {
    /// Returns the updated context and whether this handler took the error.
    fn handle(&self, ctx: FlowEventContext, err: &FlowEventError) -> (FlowEventContext, bool);
}

/// Rolls back and asks for redelivery.
pub struct TransientExceptionHandler {
    max_retry_attempts: u32,
}

impl TransientExceptionHandler {
    pub fn new(max_retry_attempts: u32) -> Self {
        Self { max_retry_attempts }
    }
}

impl ExceptionHandler for TransientExceptionHandler {
    fn handle(&self, mut ctx: FlowEventContext, err: &FlowEventError) -> (FlowEventContext, bool) {
        let FlowEventError::Transient(message) = err else {
            return (ctx, false);
        };

        // A new flow that failed on its first event keeps a checkpoint
        // holding only the retry count.
        let rollback = match (&ctx.original, &ctx.checkpoint) {
            (Some(original), _) => Some(original.clone()),
            (None, Some(working)) => Some(FlowCheckpoint::new(
                working.flow_id.clone(),
                working.flow_name.clone(),
                working.identity.clone(),
                working.created_at,
            )),
            (None, None) => None,
        };

        let attempts = rollback.as_ref().map_or(1, |cp| cp.retry_count + 1);
        if attempts > self.max_retry_attempts {
            warn!(
                flow_id = %ctx.input.flow_id,
                attempts,
                error = %message,
                "Retry attempts exhausted"
            );
            return (ctx, false);
        }

        warn!(
            flow_id = %ctx.input.flow_id,
            event_kind = ctx.input.kind(),
            attempt = attempts,
            error = %message,
            "Transient failure, event will be redelivered"
        );
        ctx.checkpoint = rollback.map(|mut cp| {
            cp.retry_count = attempts;
            cp.in_retry = true;
            cp
        });
        ctx.outputs.clear();
        ctx.continuation = FlowContinuation::Continue;
        ctx.retry = true;
        (ctx, true)
    }
}

/// Hands business and platform errors to the flow logic.
///
/// The first one in a run resumes the logic with the error. A second
/// fails the flow.
pub struct BusinessExceptionHandler {
    sessions: SessionManager,
}

impl BusinessExceptionHandler {
    pub fn new() -> Self {
        Self {
            sessions: SessionManager::new(),
        }
    }
}

impl Default for BusinessExceptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionHandler for BusinessExceptionHandler {
    fn handle(&self, mut ctx: FlowEventContext, err: &FlowEventError) -> (FlowEventContext, bool) {
        let message = match err {
            FlowEventError::Business(message) | FlowEventError::Platform(message) => message.clone(),
            _ => return (ctx, false),
        };
        if ctx.checkpoint.is_none() {
            return (ctx, false);
        }

        if !ctx.business_error_delivered {
            warn!(flow_id = %ctx.input.flow_id, error = %message, "Delivering error to flow");
            ctx.business_error_delivered = true;
            ctx.continuation = FlowContinuation::Error(message);
            return (ctx, true);
        }

        warn!(flow_id = %ctx.input.flow_id, error = %message, "Unhandled error, failing flow");
        let now = ctx.now;
        let FlowEventContext { checkpoint, outputs, .. } = &mut ctx;
        if let Some(cp) = checkpoint.as_mut() {
            finish(&self.sessions, cp, outputs, FlowResult::Failure { message }, now);
        }
        ctx.continuation = FlowContinuation::Continue;
        (ctx, true)
    }
}

/// Terminates the flow and dead-letters the event. Accepts any error.
pub struct FatalExceptionHandler {
    sessions: SessionManager,
}

impl FatalExceptionHandler {
    pub fn new() -> Self {
        Self {
            sessions: SessionManager::new(),
        }
    }
}

impl Default for FatalExceptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionHandler for FatalExceptionHandler {
    fn handle(&self, mut ctx: FlowEventContext, err: &FlowEventError) -> (FlowEventContext, bool) {
        error!(
            flow_id = %ctx.input.flow_id,
            event_kind = ctx.input.kind(),
            error = %err,
            "Flow failed"
        );

        let reason = err.to_string();
        let now = ctx.now;
        ctx.outputs.clear();

        let FlowEventContext { checkpoint, outputs, .. } = &mut ctx;
        if let Some(cp) = checkpoint.as_mut() {
            notify_open_sessions(&self.sessions, cp, outputs, now, |_| {
                Some(SessionBody::Error {
                    message: format!("counterparty flow failed: {}", reason),
                })
            });
        }
        ctx.push_status(FlowStatus::Failed { message: reason.clone() });
        ctx.outputs.push(OutputRecord::DeadLetter(DeadLetterRecord {
            event: ctx.input.clone(),
            reason,
            timestamp: now,
        }));

        ctx.send_to_dead_letter = true;
        ctx.terminate = true;
        ctx.retry = false;
        ctx.continuation = FlowContinuation::Terminate;
        (ctx, true)
    }
}

/// Ordered handlers, most specific first, fatal last.
pub struct ExceptionHandlerChain {
    handlers: Vec<Box<dyn ExceptionHandler>>,
    fallback: FatalExceptionHandler,
}

impl ExceptionHandlerChain {
    pub fn new(max_retry_attempts: u32) -> Self {
        Self {
            handlers: vec![
                Box::new(TransientExceptionHandler::new(max_retry_attempts)),
                Box::new(BusinessExceptionHandler::new()),
                Box::new(FatalExceptionHandler::new()),
            ],
            fallback: FatalExceptionHandler::new(),
        }
    }

    pub fn handle(&self, mut ctx: FlowEventContext, err: &FlowEventError) -> FlowEventContext {
        for handler in &self.handlers {
            let (next, handled) = handler.handle(ctx, err);
            if handled {
                return next;
            }
            ctx = next;
        }
        self.escalate(ctx, err)
    }

    /// Skips straight to the fatal handler.
    pub fn escalate(&self, ctx: FlowEventContext, err: &FlowEventError) -> FlowEventContext {
        self.fallback.handle(ctx, err).0
    }
}
