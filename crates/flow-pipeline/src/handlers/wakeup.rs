use flow_checkpoint::SuspensionPoint;
use flow_types::Wakeup;
use tracing::debug;

use crate::context::{FlowContinuation, FlowEventContext};
use crate::error::FlowEventError;
use crate::logic::Resume;

/// Resumes a sleeping flow once its timer is due.
///
/// Wakeups also drive resends, which post-processing handles for every event.
pub(crate) struct WakeupHandler;

impl WakeupHandler {
    pub(crate) fn handle(ctx: &mut FlowEventContext, wakeup: Wakeup) -> Result<(), FlowEventError> {
        let Some(cp) = &ctx.checkpoint else {
            debug!(flow_id = %ctx.input.flow_id, "Wakeup for unknown flow");
            ctx.ignored = true;
            return Ok(());
        };

        match cp.suspension {
            Some(SuspensionPoint::AwaitingTimer { at }) if ctx.now >= at => {
                debug!(flow_id = %cp.flow_id, at = %at, "Timer elapsed");
                ctx.continuation = FlowContinuation::Run(Resume::Woken);
            }
            _ => {
                debug!(flow_id = %cp.flow_id, fire_at = %wakeup.fire_at, "Wakeup");
            }
        }
        Ok(())
    }
}
