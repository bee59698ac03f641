//! Working state of one pipeline run.

use chrono::{DateTime, Utc};
use flow_checkpoint::FlowCheckpoint;
use flow_types::{FlowEvent, FlowStatus, FlowStatusUpdate, OutputRecord, SessionId};
use session_protocol::{position, SessionError, SessionResult, SessionState};

use crate::error::FlowEventError;
use crate::logic::Resume;

/// What the pipeline does with the flow logic after a handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowContinuation {
    /// Stay suspended.
    Continue,
    /// Resume the logic with a value.
    Run(Resume),
    /// Resume the logic with an error at its current suspension point.
    Error(String),
    /// Remove the flow.
    Terminate,
}

/// Everything one event's processing reads and writes. Never persisted.
#[derive(Debug)]
pub struct FlowEventContext {
    /// Working copy; committed at the end of the run.
    pub checkpoint: Option<FlowCheckpoint>,
    /// The checkpoint as loaded. Transient rollback target.
    pub original: Option<FlowCheckpoint>,
    pub input: FlowEvent,
    pub outputs: Vec<OutputRecord>,
    pub send_to_dead_letter: bool,
    /// The loaded checkpoint was waiting for this event to be redelivered.
    pub is_retry_event: bool,
    pub continuation: FlowContinuation,
    pub now: DateTime<Utc>,
    /// Commit `None` instead of the working copy.
    pub terminate: bool,
    /// Roll back and ask for redelivery.
    pub retry: bool,
    /// Nothing to commit.
    pub ignored: bool,
    /// A business error was already handed to the logic during this run.
    pub business_error_delivered: bool,
    /// Version of the loaded checkpoint, 0 if there was none.
    pub expected_version: u64,
}

impl FlowEventContext {
    pub fn new(input: FlowEvent, loaded: Option<FlowCheckpoint>, now: DateTime<Utc>) -> Self {
        let is_retry_event = loaded.as_ref().is_some_and(|cp| cp.in_retry);
        let expected_version = loaded.as_ref().map_or(0, |cp| cp.version);
        Self {
            checkpoint: loaded.clone(),
            original: loaded,
            input,
            outputs: Vec::new(),
            send_to_dead_letter: false,
            is_retry_event,
            continuation: FlowContinuation::Continue,
            now,
            terminate: false,
            retry: false,
            ignored: false,
            business_error_delivered: false,
            expected_version,
        }
    }

    /// The working checkpoint, which must exist at this point of the run.
    pub(crate) fn checkpoint_mut(&mut self) -> Result<&mut FlowCheckpoint, FlowEventError> {
        self.checkpoint
            .as_mut()
            .ok_or_else(|| FlowEventError::Fatal(format!("flow {} has no checkpoint", self.input.flow_id)))
    }

    /// Name of the flow, if known from the checkpoint or the start request.
    pub(crate) fn flow_name(&self) -> Option<String> {
        if let Some(cp) = &self.checkpoint {
            return Some(cp.flow_name.clone());
        }
        match &self.input.payload {
            flow_types::FlowEventPayload::StartFlow(request) => Some(request.flow_name.clone()),
            _ => None,
        }
    }

    pub(crate) fn push_status(&mut self, status: FlowStatus) {
        let Some(flow_name) = self.flow_name() else {
            return;
        };
        self.outputs.push(OutputRecord::FlowStatus(FlowStatusUpdate {
            flow_id: self.input.flow_id.clone(),
            flow_name,
            status,
            timestamp: self.now,
        }));
    }
}

/// Replaces the session `session_id` with the result of `f`.
///
/// The session is left untouched when `f` fails.
pub(crate) fn update_session<T>(
    sessions: &mut [SessionState],
    session_id: &SessionId,
    f: impl FnOnce(SessionState) -> SessionResult<(SessionState, T)>,
) -> SessionResult<T> {
    let index = position(sessions, session_id)?.ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
    let (next, value) = f(sessions[index].clone())?;
    sessions[index] = next;
    Ok(value)
}
