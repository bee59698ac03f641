//! The stages of one pipeline run that sit between load and commit.

use external_outbox::OutboxProcessor;
use flow_checkpoint::ExternalReply;
use flow_types::Payload;
use session_protocol::SessionManager;

use crate::config::EngineConfig;
use crate::context::FlowEventContext;
use crate::error::FlowEventError;
use crate::handlers;
use crate::registry::FlowRegistry;

/// The outbox as used by flow checkpoints.
pub(crate) type Outbox = OutboxProcessor<Payload, ExternalReply>;

pub(crate) struct Executor {
    pub(crate) registry: FlowRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) sessions: SessionManager,
    pub(crate) outbox: Outbox,
}

impl Executor {
    pub(crate) fn new(registry: FlowRegistry, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            sessions: SessionManager::new(),
            outbox: Outbox::new(),
        }
    }

    /// Validate, dispatch to the event handler, then resume.
    pub(crate) fn execute(&self, ctx: &mut FlowEventContext) -> Result<(), FlowEventError> {
        if let Some(cp) = &ctx.checkpoint {
            cp.validate()?;
        }
        handlers::dispatch(self, ctx)?;
        self.resume(ctx)
    }

    /// Runs the flow logic if the continuation asks for it, then post-processes.
    pub(crate) fn resume(&self, ctx: &mut FlowEventContext) -> Result<(), FlowEventError> {
        if ctx.ignored || ctx.terminate || ctx.retry {
            return Ok(());
        }
        self.run_fiber(ctx)?;
        self.post_process(ctx)
    }
}
