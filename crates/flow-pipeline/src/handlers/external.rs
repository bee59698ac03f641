use external_outbox::OutboxResponse;
use flow_checkpoint::SuspensionPoint;
use flow_types::{ExternalErrorKind, ExternalOutcome, ExternalRequest, ExternalResponse, OutputRecord};
use tracing::{debug, warn};

use crate::context::{FlowContinuation, FlowEventContext};
use crate::error::FlowEventError;
use crate::executor::Executor;
use crate::logic::Resume;

/// Resolves an outstanding outbox request.
///
/// The slot is cleared as soon as the flow resumes, so a redelivered
/// response finds nothing and the flow resumes once per request.
pub(crate) struct ExternalResponseHandler;

impl ExternalResponseHandler {
    pub(crate) fn handle(
        exec: &Executor,
        ctx: &mut FlowEventContext,
        response: ExternalResponse,
    ) -> Result<(), FlowEventError> {
        let now = ctx.now;
        let Some(cp) = ctx.checkpoint.as_mut() else {
            debug!(flow_id = %ctx.input.flow_id, request_id = %response.request_id, "Response for unknown flow");
            ctx.ignored = true;
            return Ok(());
        };

        let category = response.category;
        let Some(pending) = cp.pending_requests.remove(&category) else {
            debug!(flow_id = %cp.flow_id, request_id = %response.request_id, "No outstanding request");
            return Ok(());
        };
        if pending.request_id != response.request_id || pending.is_resolved() {
            debug!(
                flow_id = %cp.flow_id,
                expected = %pending.request_id,
                actual = %response.request_id,
                "Ignoring stale response"
            );
            cp.pending_requests.insert(category, pending);
            return Ok(());
        }
        let pending = exec.outbox.process_message_received(
            pending,
            OutboxResponse {
                request_id: response.request_id.clone(),
                payload: response.outcome.clone(),
            },
        );

        let awaited = matches!(
            &cp.suspension,
            Some(SuspensionPoint::AwaitingExternal { category: c, request_id }) if *c == category && *request_id == response.request_id
        );

        match response.outcome {
            ExternalOutcome::Success { payload } => {
                debug!(flow_id = %cp.flow_id, request_id = %pending.request_id, attempts = pending.attempts, "External request succeeded");
                if awaited {
                    ctx.continuation = FlowContinuation::Run(Resume::External {
                        category,
                        value: payload,
                    });
                }
            }
            ExternalOutcome::Failure {
                kind: ExternalErrorKind::Transient,
                message,
            } => {
                let (pending, request) = exec.outbox.force_resend(pending, now);
                warn!(
                    flow_id = %cp.flow_id,
                    request_id = %pending.request_id,
                    attempt = pending.attempts,
                    error = %message,
                    "External request failed transiently, resending"
                );
                ctx.outputs.push(OutputRecord::ExternalRequest(ExternalRequest {
                    flow_id: cp.flow_id.clone(),
                    request_id: pending.request_id.clone(),
                    category,
                    payload: request,
                    attempt: pending.attempts,
                    timestamp: now,
                }));
                cp.pending_requests.insert(category, pending);
            }
            ExternalOutcome::Failure {
                kind: ExternalErrorKind::Platform,
                message,
            } => {
                debug!(flow_id = %cp.flow_id, request_id = %pending.request_id, error = %message, "External request failed");
                if awaited {
                    ctx.continuation = FlowContinuation::Error(message);
                }
            }
            ExternalOutcome::Failure {
                kind: ExternalErrorKind::Fatal,
                message,
            } => {
                return Err(FlowEventError::Fatal(format!(
                    "{} request {} failed: {}",
                    category, pending.request_id, message
                )));
            }
        }
        Ok(())
    }
}
