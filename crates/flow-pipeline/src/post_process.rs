//! Work done after every handler run, whether or not the logic resumed.

use chrono::{DateTime, Utc};
use flow_checkpoint::SuspensionPoint;
use flow_types::{ExternalRequest, OutputRecord, ScheduledWakeup, SessionBody};
use session_protocol::SessionState;
use tracing::{debug, info};

use crate::context::FlowEventContext;
use crate::error::FlowEventError;
use crate::executor::Executor;

impl Executor {
    pub(crate) fn post_process(&self, ctx: &mut FlowEventContext) -> Result<(), FlowEventError> {
        let now = ctx.now;
        let FlowEventContext {
            checkpoint,
            outputs,
            terminate,
            ..
        } = ctx;
        let Some(cp) = checkpoint.as_mut() else {
            return Ok(());
        };
        let done = cp.is_done();

        for state in cp.sessions.iter_mut() {
            *state = self.absorb_received(state.clone(), done);

            if let Some(notice) = state.error_notice.clone() {
                let (next, event) =
                    self.sessions
                        .process_message_to_send(state.clone(), SessionBody::Error { message: notice }, now)?;
                *state = next;
                outputs.push(OutputRecord::Session(event));
            }

            let (next, due) = self
                .sessions
                .get_messages_to_send(state.clone(), now, self.config.session_resend_window);
            *state = next;
            outputs.extend(due.into_iter().map(OutputRecord::Session));
        }

        let categories: Vec<_> = cp.pending_requests.keys().copied().collect();
        for category in categories {
            let Some(pending) = cp.pending_requests.remove(&category) else {
                continue;
            };
            let (pending, resend) =
                self.outbox
                    .get_message_to_send(pending, now, self.config.external_resend_window);
            if let Some(payload) = resend {
                debug!(flow_id = %cp.flow_id, request_id = %pending.request_id, attempt = pending.attempts, "Resending external request");
                outputs.push(OutputRecord::ExternalRequest(ExternalRequest {
                    flow_id: cp.flow_id.clone(),
                    request_id: pending.request_id.clone(),
                    category,
                    payload,
                    attempt: pending.attempts,
                    timestamp: now,
                }));
            }
            cp.pending_requests.insert(category, pending);
        }

        if done && !cp.has_open_sessions() {
            info!(flow_id = %cp.flow_id, flow_name = %cp.flow_name, "Flow drained, removing checkpoint");
            *terminate = true;
            return Ok(());
        }

        let outbox_resends = cp
            .pending_requests
            .values()
            .filter_map(|req| self.outbox.next_resend_at(req));
        if let Some(fire_at) = self.next_deadline(cp.suspension.as_ref(), &cp.sessions, outbox_resends) {
            outputs.push(OutputRecord::ScheduleWakeup(ScheduledWakeup {
                flow_id: cp.flow_id.clone(),
                fire_at,
            }));
        }

        cp.in_retry = false;
        cp.retry_count = 0;
        cp.updated_at = now;
        Ok(())
    }

    /// Consumes received messages the flow logic will never ask for.
    ///
    /// A `Confirm` at the head of the buffer is always consumed. Once the
    /// flow is done, everything is.
    fn absorb_received(&self, mut state: SessionState, done: bool) -> SessionState {
        while let Some(event) = self.sessions.get_next_received_event(&state) {
            let absorbed = done || matches!(event.body, SessionBody::Confirm);
            if !absorbed {
                break;
            }
            if done {
                debug!(
                    session_id = %state.session_id,
                    kind = event.body.kind(),
                    "Draining message for finished flow"
                );
            }
            let seq = event.sequence_num;
            state = self.sessions.acknowledge_received_event(state, seq);
        }
        state
    }

    /// The earliest time the flow needs another look: its timer or a resend.
    fn next_deadline(
        &self,
        suspension: Option<&SuspensionPoint>,
        sessions: &[SessionState],
        outbox_resends: impl Iterator<Item = DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let timer = match suspension {
            Some(SuspensionPoint::AwaitingTimer { at }) => Some(*at),
            _ => None,
        };
        let session_resends = sessions
            .iter()
            .filter_map(|s| self.sessions.next_resend_at(s, self.config.session_resend_window));

        timer.into_iter().chain(session_resends).chain(outbox_resends).min()
    }
}
