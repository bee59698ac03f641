//! Event handlers, one per inbound event kind.
//!
//! A handler updates the working checkpoint for its event and decides the
//! [`FlowContinuation`](crate::context::FlowContinuation). Dispatch is a
//! plain match on the closed event enum.

mod external;
mod kill;
mod session;
mod start;
mod wakeup;

use flow_types::FlowEventPayload;

use crate::context::FlowEventContext;
use crate::error::FlowEventError;
use crate::executor::Executor;

pub(crate) use external::ExternalResponseHandler;
pub(crate) use kill::KillHandler;
pub(crate) use session::SessionEventHandler;
pub(crate) use start::StartFlowHandler;
pub(crate) use wakeup::WakeupHandler;

pub(crate) fn dispatch(exec: &Executor, ctx: &mut FlowEventContext) -> Result<(), FlowEventError> {
    match ctx.input.payload.clone() {
        FlowEventPayload::StartFlow(request) => StartFlowHandler::handle(exec, ctx, request),
        FlowEventPayload::Session(event) => SessionEventHandler::handle(exec, ctx, event),
        FlowEventPayload::ExternalResponse(response) => ExternalResponseHandler::handle(exec, ctx, response),
        FlowEventPayload::Wakeup(wakeup) => WakeupHandler::handle(ctx, wakeup),
        FlowEventPayload::Kill(request) => KillHandler::handle(exec, ctx, request),
    }
}
