use flow_types::{FlowStatus, KillRequest, SessionBody};
use tracing::warn;

use crate::context::{FlowContinuation, FlowEventContext};
use crate::error::FlowEventError;
use crate::executor::Executor;
use crate::fiber::notify_open_sessions;

/// Terminates a flow on operator request.
///
/// Open sessions get an `Error`; outstanding requests are abandoned.
pub(crate) struct KillHandler;

impl KillHandler {
    pub(crate) fn handle(exec: &Executor, ctx: &mut FlowEventContext, request: KillRequest) -> Result<(), FlowEventError> {
        let now = ctx.now;
        let Some(cp) = ctx.checkpoint.as_mut() else {
            warn!(flow_id = %ctx.input.flow_id, "Kill for unknown flow");
            ctx.ignored = true;
            return Ok(());
        };

        warn!(flow_id = %cp.flow_id, reason = %request.reason, "Killing flow");
        let message = format!("flow killed: {}", request.reason);
        notify_open_sessions(&exec.sessions, cp, &mut ctx.outputs, now, |_| {
            Some(SessionBody::Error {
                message: message.clone(),
            })
        });
        cp.pending_requests.clear();

        ctx.push_status(FlowStatus::Killed { reason: request.reason });
        ctx.terminate = true;
        ctx.continuation = FlowContinuation::Terminate;
        Ok(())
    }
}
