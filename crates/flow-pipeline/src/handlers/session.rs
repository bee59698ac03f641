use chrono::{DateTime, Utc};
use flow_checkpoint::{FlowCheckpoint, SuspensionPoint};
use flow_types::{
    DeadLetterRecord, FlowStatus, MessageDirection, OutputRecord, Payload, SessionBody, SessionEvent,
};
use session_protocol::position;
use tracing::{debug, info, warn};

use crate::context::{update_session, FlowContinuation, FlowEventContext};
use crate::error::FlowEventError;
use crate::executor::Executor;
use crate::logic::{InitiatedBy, Resume};

/// Applies a message from a counterparty to the flow's session state.
pub(crate) struct SessionEventHandler;

impl SessionEventHandler {
    pub(crate) fn handle(exec: &Executor, ctx: &mut FlowEventContext, event: SessionEvent) -> Result<(), FlowEventError> {
        let started = ctx.checkpoint.as_ref().is_some_and(FlowCheckpoint::has_started);
        if !started {
            if let SessionBody::Init { protocol, payload } = &event.body {
                return Self::start_responder(exec, ctx, &event, protocol, payload.clone());
            }
            debug!(
                flow_id = %ctx.input.flow_id,
                session_id = %event.session_id,
                kind = event.body.kind(),
                "Session message before the flow started"
            );
            ctx.ignored = ctx.checkpoint.is_none();
            return Ok(());
        }

        let cp = ctx.checkpoint_mut()?;
        if position(&cp.sessions, &event.session_id)?.is_none() {
            debug!(flow_id = %cp.flow_id, session_id = %event.session_id, "Message for unknown session");
            return Ok(());
        }
        update_session(&mut cp.sessions, &event.session_id, |s| {
            exec.sessions.process_message_received(s, &event).map(|s| (s, ()))
        })?;

        let awaited = matches!(
            &cp.suspension,
            Some(SuspensionPoint::AwaitingSession { session_id }) if *session_id == event.session_id
        );
        if !awaited {
            return Ok(());
        }
        let resume = update_session(&mut cp.sessions, &event.session_id, |s| Ok(exec.next_session_input(s)))?;
        ctx.continuation = match resume {
            Some(Resume::Error { message }) => FlowContinuation::Error(message),
            Some(resume) => FlowContinuation::Run(resume),
            None => FlowContinuation::Continue,
        };
        Ok(())
    }

    /// Accepts an incoming session and starts the responder flow with the
    /// payload of its `Init`.
    fn start_responder(
        exec: &Executor,
        ctx: &mut FlowEventContext,
        init: &SessionEvent,
        protocol: &str,
        payload: Payload,
    ) -> Result<(), FlowEventError> {
        let Some(flow_name) = exec.registry.responder_for(protocol) else {
            return Self::reject(ctx, init, protocol);
        };

        let identity = init.destination.clone();
        let (state, confirm) = exec.sessions.accept(init, identity.clone(), ctx.now)?;
        let session_id = state.session_id.clone();

        let checkpoint = ctx
            .checkpoint
            .get_or_insert_with(|| FlowCheckpoint::new(ctx.input.flow_id.clone(), flow_name, identity, ctx.now));
        checkpoint.sessions.push(state);
        // The Init becomes the responder's start arguments.
        update_session(&mut checkpoint.sessions, &session_id, |s| {
            Ok((exec.sessions.acknowledge_received_event(s, init.sequence_num), ()))
        })?;

        info!(
            flow_id = %checkpoint.flow_id,
            flow_name = %checkpoint.flow_name,
            session_id = %session_id,
            initiator = %init.source,
            "Starting responder flow"
        );
        ctx.outputs.push(OutputRecord::Session(confirm));
        ctx.push_status(FlowStatus::Running);
        ctx.continuation = FlowContinuation::Run(Resume::Start {
            args: payload,
            initiated_by: Some(InitiatedBy {
                party: init.source.clone(),
                session_id,
            }),
        });
        Ok(())
    }

    /// Answers an `Init` nobody can respond to with an `Error`, without
    /// creating a flow.
    fn reject(ctx: &mut FlowEventContext, init: &SessionEvent, protocol: &str) -> Result<(), FlowEventError> {
        let reason = format!("no responder registered for protocol {}", protocol);
        warn!(
            flow_id = %ctx.input.flow_id,
            session_id = %init.session_id,
            initiator = %init.source,
            reason = %reason,
            "Rejecting session"
        );
        ctx.outputs.push(OutputRecord::Session(rejection(init, &reason, ctx.now)));
        ctx.outputs.push(OutputRecord::DeadLetter(DeadLetterRecord {
            event: ctx.input.clone(),
            reason,
            timestamp: ctx.now,
        }));
        ctx.send_to_dead_letter = true;
        ctx.terminate = true;
        ctx.continuation = FlowContinuation::Terminate;
        Ok(())
    }
}

/// An `Error` in place of the `Confirm`, acknowledging the `Init`.
fn rejection(init: &SessionEvent, reason: &str, now: DateTime<Utc>) -> SessionEvent {
    SessionEvent {
        session_id: init.session_id.clone(),
        source: init.destination.clone(),
        destination: init.source.clone(),
        direction: MessageDirection::Outbound,
        sequence_num: 1,
        received_sequence: init.sequence_num,
        out_of_order_sequences: Vec::new(),
        body: SessionBody::Error {
            message: reason.to_string(),
        },
        timestamp: now,
    }
}
