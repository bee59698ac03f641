//! The flow event pipeline.
//!
//! ```text
//! load ─▶ validate ─▶ handler ─▶ fiber ─▶ post-process ─▶ commit
//!                        └──── errors ─▶ exception chain ─┘
//! ```
//!
//! One call to [`FlowEventPipeline::process`] applies one event to one flow
//! and commits the result atomically. Events for the same flow must not be
//! processed concurrently; the worker pool guarantees that.

use std::sync::Arc;

use flow_checkpoint::CheckpointStore;
use flow_types::{
    Clock, FlowEvent, FlowEventPayload, MessageDirection, OutputRecord, SessionBody, SessionEvent, SystemClock,
};
use tracing::{debug, info_span, warn};

use crate::config::EngineConfig;
use crate::context::FlowEventContext;
use crate::error::PipelineResult;
use crate::exception::ExceptionHandlerChain;
use crate::executor::Executor;
use crate::registry::FlowRegistry;

/// Error rounds tolerated in one run before the flow is failed outright.
const MAX_ERROR_ROUNDS: u32 = 3;

/// Result of processing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The new checkpoint (or its removal) and these outputs were committed.
    Committed {
        terminated: bool,
        outputs: Vec<OutputRecord>,
    },
    /// Rolled back. Redeliver the same event.
    Retry,
    /// The flow was failed and the event dead-lettered.
    DeadLettered { outputs: Vec<OutputRecord> },
    /// Nothing to do and nothing committed.
    Ignored,
}

/// Applies inbound events to flow checkpoints.
pub struct FlowEventPipeline<S> {
    store: S,
    clock: Arc<dyn Clock>,
    executor: Executor,
    exceptions: ExceptionHandlerChain,
}

impl<S: CheckpointStore> FlowEventPipeline<S> {
    pub fn new(store: S, registry: FlowRegistry, config: EngineConfig) -> Self {
        Self::with_clock(store, registry, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, registry: FlowRegistry, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let exceptions = ExceptionHandlerChain::new(config.max_retry_attempts);
        Self {
            store,
            clock,
            executor: Executor::new(registry, config),
            exceptions,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.executor.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Processes one event.
    ///
    /// Flow errors never escape: they are turned into a retry, an error the
    /// logic sees, or a dead-lettered termination. Only store failures are
    /// returned, in which case nothing was committed.
    pub fn process(&self, event: FlowEvent) -> PipelineResult<PipelineOutcome> {
        let span = info_span!("flow_event", flow_id = %event.flow_id, event_kind = event.kind());
        let _guard = span.enter();

        let now = self.clock.now();
        let loaded = self.store.load(&event.flow_id)?;
        if loaded.is_none() && self.store.is_terminated(&event.flow_id)? {
            return self.process_terminated(event, now);
        }

        let ctx = self.run(FlowEventContext::new(event, loaded, now));
        self.commit(ctx)
    }

    fn run(&self, mut ctx: FlowEventContext) -> FlowEventContext {
        let mut result = self.executor.execute(&mut ctx);
        let mut rounds = 0;
        while let Err(err) = result {
            rounds += 1;
            debug!(error = %err, round = rounds, "Handling flow error");
            ctx = if rounds > MAX_ERROR_ROUNDS {
                self.exceptions.escalate(ctx, &err)
            } else {
                self.exceptions.handle(ctx, &err)
            };
            if ctx.retry || ctx.terminate {
                break;
            }
            result = self.executor.resume(&mut ctx);
        }
        ctx
    }

    fn commit(&self, ctx: FlowEventContext) -> PipelineResult<PipelineOutcome> {
        let flow_id = &ctx.input.flow_id;

        if ctx.ignored {
            debug!("Nothing to commit");
            return Ok(PipelineOutcome::Ignored);
        }

        if ctx.retry {
            if let Some(cp) = &ctx.checkpoint {
                self.store.save(flow_id, ctx.expected_version, Some(cp), &[])?;
            }
            return Ok(PipelineOutcome::Retry);
        }

        if ctx.terminate {
            self.store.save(flow_id, ctx.expected_version, None, &ctx.outputs)?;
            return Ok(if ctx.send_to_dead_letter {
                PipelineOutcome::DeadLettered { outputs: ctx.outputs }
            } else {
                PipelineOutcome::Committed {
                    terminated: true,
                    outputs: ctx.outputs,
                }
            });
        }

        match &ctx.checkpoint {
            Some(cp) => {
                self.store.save(flow_id, ctx.expected_version, Some(cp), &ctx.outputs)?;
                Ok(PipelineOutcome::Committed {
                    terminated: false,
                    outputs: ctx.outputs,
                })
            }
            None => Ok(PipelineOutcome::Ignored),
        }
    }

    /// Events for a flow that already terminated.
    ///
    /// Sequenced session messages are acknowledged without state so the
    /// counterparty stops resending. Anything else is dropped.
    fn process_terminated(&self, event: FlowEvent, now: chrono::DateTime<chrono::Utc>) -> PipelineResult<PipelineOutcome> {
        let FlowEventPayload::Session(message) = &event.payload else {
            debug!("Event for terminated flow");
            return Ok(PipelineOutcome::Ignored);
        };
        if !message.body.is_sequenced() {
            return Ok(PipelineOutcome::Ignored);
        }

        warn!(
            session_id = %message.session_id,
            sequence = message.sequence_num,
            kind = message.body.kind(),
            "Session message for terminated flow, acknowledging"
        );
        let ack = SessionEvent {
            session_id: message.session_id.clone(),
            source: message.destination.clone(),
            destination: message.source.clone(),
            direction: MessageDirection::Outbound,
            sequence_num: 0,
            received_sequence: message.sequence_num,
            out_of_order_sequences: Vec::new(),
            body: SessionBody::Ack,
            timestamp: now,
        };
        let outputs = vec![OutputRecord::Session(ack)];
        self.store.save(&event.flow_id, 0, None, &outputs)?;
        Ok(PipelineOutcome::Committed {
            terminated: true,
            outputs,
        })
    }
}
