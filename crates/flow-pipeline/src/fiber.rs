//! Fiber driver: runs flow logic from one suspension point to the next.
//!
//! Each step is applied atomically. If the logic or any command it issued
//! fails, the checkpoint and outputs are restored to how they were before
//! the step, so the error handlers see the flow at its last suspension point.

use chrono::{DateTime, Utc};
use flow_checkpoint::{FlowCheckpoint, FlowResult, SuspensionPoint};
use flow_types::{ExternalRequest, FlowStatus, FlowStatusUpdate, OutputRecord, SessionBody};
use session_protocol::{position, SessionError, SessionManager, SessionState, SessionStatus};
use tracing::{debug, info, warn};

use crate::context::{update_session, FlowContinuation, FlowEventContext};
use crate::error::FlowEventError;
use crate::executor::Executor;
use crate::logic::{FiberContext, FlowLogic, FlowStep, Resume, SessionCommand};

impl Executor {
    pub(crate) fn run_fiber(&self, ctx: &mut FlowEventContext) -> Result<(), FlowEventError> {
        let mut input = match std::mem::replace(&mut ctx.continuation, FlowContinuation::Continue) {
            FlowContinuation::Run(resume) => resume,
            FlowContinuation::Error(message) => Resume::Error { message },
            FlowContinuation::Continue | FlowContinuation::Terminate => return Ok(()),
        };

        let now = ctx.now;
        let FlowEventContext { checkpoint, outputs, .. } = ctx;
        let Some(cp) = checkpoint.as_mut() else {
            return Err(FlowEventError::Fatal("cannot resume a flow without a checkpoint".into()));
        };
        if cp.is_done() {
            debug!(flow_id = %cp.flow_id, "Flow already finished, not resuming");
            return Ok(());
        }
        let logic = self
            .registry
            .flow(&cp.flow_name)
            .ok_or_else(|| FlowEventError::Fatal(format!("no flow registered as {}", cp.flow_name)))?;

        for _ in 0..self.config.max_fiber_steps {
            let snapshot = cp.clone();
            let mark = outputs.len();
            match self.step(logic.as_ref(), cp, outputs, input, now) {
                Ok(Some(next)) => input = next,
                Ok(None) => return Ok(()),
                Err(err) => {
                    *cp = snapshot;
                    outputs.truncate(mark);
                    return Err(err);
                }
            }
        }

        Err(FlowEventError::Fatal(format!(
            "flow {} did not suspend within {} steps",
            cp.flow_id, self.config.max_fiber_steps
        )))
    }

    fn step(
        &self,
        logic: &dyn FlowLogic,
        cp: &mut FlowCheckpoint,
        outputs: &mut Vec<OutputRecord>,
        input: Resume,
        now: DateTime<Utc>,
    ) -> Result<Option<Resume>, FlowEventError> {
        let (result, commands) = {
            let mut fiber = FiberContext::new(&cp.flow_id, &cp.identity, now, &mut cp.fiber);
            let result = logic.resume(&mut fiber, input);
            (result, fiber.into_commands())
        };
        let step = result?;

        for command in commands {
            self.apply_command(cp, outputs, command, now)?;
        }
        self.apply_step(cp, outputs, step, now)
    }

    fn apply_command(
        &self,
        cp: &mut FlowCheckpoint,
        outputs: &mut Vec<OutputRecord>,
        command: SessionCommand,
        now: DateTime<Utc>,
    ) -> Result<(), FlowEventError> {
        let event = match command {
            SessionCommand::Initiate {
                session_id,
                counterparty,
                protocol,
                payload,
            } => {
                if position(&cp.sessions, &session_id)?.is_some() {
                    return Err(SessionError::DuplicateSession(session_id).into());
                }
                debug!(
                    flow_id = %cp.flow_id,
                    session_id = %session_id,
                    counterparty = %counterparty,
                    protocol = %protocol,
                    "Initiating session"
                );
                let (state, init) =
                    self.sessions
                        .initiate(session_id, cp.identity.clone(), counterparty, protocol, payload, now);
                cp.sessions.push(state);
                init
            }
            SessionCommand::Send { session_id, payload } => update_session(&mut cp.sessions, &session_id, |s| {
                self.sessions.process_message_to_send(s, SessionBody::Data { payload }, now)
            })?,
            SessionCommand::Close { session_id } => update_session(&mut cp.sessions, &session_id, |s| {
                self.sessions.process_message_to_send(s, SessionBody::Close, now)
            })?,
        };
        outputs.push(OutputRecord::Session(event));
        Ok(())
    }

    fn apply_step(
        &self,
        cp: &mut FlowCheckpoint,
        outputs: &mut Vec<OutputRecord>,
        step: FlowStep,
        now: DateTime<Utc>,
    ) -> Result<Option<Resume>, FlowEventError> {
        match step {
            FlowStep::Receive { session_id } => {
                let next = update_session(&mut cp.sessions, &session_id, |s| Ok(self.next_session_input(s)))?;
                cp.suspension = Some(SuspensionPoint::AwaitingSession { session_id });
                Ok(next)
            }
            FlowStep::CallExternal { category, request } => {
                self.outbox.ensure_available(category, cp.pending_requests.get(&category))?;
                let request_id = cp.fiber.next_request_id(&cp.flow_id);
                let pending = self.outbox.process_message_to_send(
                    request_id.clone(),
                    category,
                    request.clone(),
                    now,
                    self.config.external_resend_window,
                );
                debug!(flow_id = %cp.flow_id, request_id = %request_id, category = %category, "Calling external service");
                outputs.push(OutputRecord::ExternalRequest(ExternalRequest {
                    flow_id: cp.flow_id.clone(),
                    request_id: request_id.clone(),
                    category,
                    payload: request,
                    attempt: pending.attempts,
                    timestamp: now,
                }));
                cp.pending_requests.insert(category, pending);
                cp.suspension = Some(SuspensionPoint::AwaitingExternal { category, request_id });
                Ok(None)
            }
            FlowStep::Sleep { until } => {
                cp.suspension = Some(SuspensionPoint::AwaitingTimer { at: until });
                Ok((now >= until).then_some(Resume::Woken))
            }
            FlowStep::Complete(payload) => {
                finish(&self.sessions, cp, outputs, FlowResult::Success { payload }, now);
                Ok(None)
            }
            FlowStep::Fail(message) => {
                finish(&self.sessions, cp, outputs, FlowResult::Failure { message }, now);
                Ok(None)
            }
        }
    }

    /// Consumes the next in-order message of a session the flow waits on.
    ///
    /// Handshake messages are consumed silently. With nothing buffered, a
    /// failed or closed session still resumes the flow so it cannot wait on
    /// it forever.
    pub(crate) fn next_session_input(&self, mut state: SessionState) -> (SessionState, Option<Resume>) {
        while let Some(event) = self.sessions.get_next_received_event(&state) {
            let seq = event.sequence_num;
            let resume = match &event.body {
                SessionBody::Data { payload } => Some(Resume::SessionData {
                    session_id: state.session_id.clone(),
                    payload: payload.clone(),
                }),
                SessionBody::Close => Some(Resume::SessionClosed {
                    session_id: state.session_id.clone(),
                }),
                SessionBody::Error { message } => Some(Resume::Error {
                    message: format!("session {} failed: {}", state.session_id, message),
                }),
                SessionBody::Init { .. } | SessionBody::Confirm | SessionBody::Ack => None,
            };
            state = self.sessions.acknowledge_received_event(state, seq);
            if resume.is_some() {
                return (state, resume);
            }
        }

        let resume = if let Some(notice) = &state.error_notice {
            Some(Resume::Error {
                message: format!("session {} failed: {}", state.session_id, notice),
            })
        } else if state.status == SessionStatus::Error {
            Some(Resume::Error {
                message: format!("session {} is in error", state.session_id),
            })
        } else if state.receive.close_received {
            Some(Resume::SessionClosed {
                session_id: state.session_id.clone(),
            })
        } else {
            None
        };
        (state, resume)
    }
}

/// Marks the flow done and tells every open session.
///
/// Success closes sessions, which then drain before the flow is removed.
/// Failure sends an `Error`. Outstanding external requests are abandoned.
pub(crate) fn finish(
    sessions: &SessionManager,
    cp: &mut FlowCheckpoint,
    outputs: &mut Vec<OutputRecord>,
    result: FlowResult,
    now: DateTime<Utc>,
) {
    let status = match &result {
        FlowResult::Success { payload } => FlowStatus::Completed {
            result: payload.clone(),
        },
        FlowResult::Failure { message } => FlowStatus::Failed {
            message: message.clone(),
        },
    };

    notify_open_sessions(sessions, cp, outputs, now, |state| match &result {
        FlowResult::Success { .. } if !state.send.close_sent => Some(SessionBody::Close),
        FlowResult::Success { .. } => None,
        FlowResult::Failure { message } => Some(SessionBody::Error {
            message: message.clone(),
        }),
    });

    if !cp.pending_requests.is_empty() {
        debug!(flow_id = %cp.flow_id, pending = cp.pending_requests.len(), "Abandoning external requests");
    }
    cp.pending_requests.clear();

    info!(flow_id = %cp.flow_id, flow_name = %cp.flow_name, status = ?status, "Flow finished");
    outputs.push(OutputRecord::FlowStatus(FlowStatusUpdate {
        flow_id: cp.flow_id.clone(),
        flow_name: cp.flow_name.clone(),
        status,
        timestamp: now,
    }));
    cp.suspension = Some(SuspensionPoint::Done { result });
}

/// Sends the body chosen by `body_for` on every session that is still open.
pub(crate) fn notify_open_sessions(
    sessions: &SessionManager,
    cp: &mut FlowCheckpoint,
    outputs: &mut Vec<OutputRecord>,
    now: DateTime<Utc>,
    body_for: impl Fn(&SessionState) -> Option<SessionBody>,
) {
    for state in cp.sessions.iter_mut() {
        if !state.status.is_open() {
            continue;
        }
        let Some(body) = body_for(state) else {
            continue;
        };
        match sessions.process_message_to_send(state.clone(), body, now) {
            Ok((next, event)) => {
                *state = next;
                outputs.push(OutputRecord::Session(event));
            }
            Err(err) => {
                warn!(
                    flow_id = %cp.flow_id,
                    session_id = %state.session_id,
                    error = %err,
                    "Could not notify session"
                );
            }
        }
    }
}
