use flow_checkpoint::FlowCheckpoint;
use flow_types::{FlowStatus, StartFlowRequest};
use tracing::{debug, info};

use crate::context::{FlowContinuation, FlowEventContext};
use crate::error::FlowEventError;
use crate::executor::Executor;
use crate::logic::Resume;

/// Creates the checkpoint of a new flow and runs its first step.
pub(crate) struct StartFlowHandler;

impl StartFlowHandler {
    pub(crate) fn handle(
        exec: &Executor,
        ctx: &mut FlowEventContext,
        request: StartFlowRequest,
    ) -> Result<(), FlowEventError> {
        if ctx.checkpoint.as_ref().is_some_and(FlowCheckpoint::has_started) {
            debug!(flow_id = %ctx.input.flow_id, "Ignoring duplicate start request");
            return Ok(());
        }

        // A checkpoint that has not started is kept for its retry count.
        let checkpoint = ctx.checkpoint.get_or_insert_with(|| {
            FlowCheckpoint::new(
                ctx.input.flow_id.clone(),
                request.flow_name.clone(),
                request.identity.clone(),
                ctx.now,
            )
        });
        if exec.registry.flow(&checkpoint.flow_name).is_none() {
            return Err(FlowEventError::Fatal(format!("no flow registered as {}", checkpoint.flow_name)));
        }

        info!(
            flow_id = %checkpoint.flow_id,
            flow_name = %checkpoint.flow_name,
            identity = %checkpoint.identity,
            retry = ctx.is_retry_event,
            "Starting flow"
        );
        ctx.push_status(FlowStatus::Running);
        ctx.continuation = FlowContinuation::Run(Resume::Start {
            args: request.args,
            initiated_by: None,
        });
        Ok(())
    }
}
