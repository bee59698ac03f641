//! The API flow logic is written against.
//!
//! A flow is a re-entrant step function. Each call to [`FlowLogic::resume`]
//! receives what the flow was waiting for and returns what it waits for
//! next. Anything that must survive between steps goes through
//! [`FiberContext::set_state`], which is persisted in the checkpoint.

use chrono::{DateTime, Utc};
use flow_checkpoint::FiberState;
use flow_types::{ExternalCategory, FlowId, Party, Payload, SessionId};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FlowError;

/// The input a flow resumes with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// First step. `initiated_by` is set for responder flows.
    Start {
        args: Payload,
        initiated_by: Option<InitiatedBy>,
    },
    /// The next in-order message on a session.
    SessionData { session_id: SessionId, payload: Payload },
    /// The counterparty closed the session.
    SessionClosed { session_id: SessionId },
    /// An external call succeeded.
    External { category: ExternalCategory, value: Payload },
    /// A sleep elapsed.
    Woken,
    /// The thing the flow waited for failed, or its last step raised a
    /// business error.
    Error { message: String },
}

/// The session a responder flow was started by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatedBy {
    pub party: Party,
    pub session_id: SessionId,
}

/// What the flow does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStep {
    /// Wait for the next message on a session.
    Receive { session_id: SessionId },
    /// Call an external subsystem and wait for its answer.
    CallExternal { category: ExternalCategory, request: Payload },
    /// Wait until a point in time.
    Sleep { until: DateTime<Utc> },
    /// Finish successfully.
    Complete(Payload),
    /// Finish with a failure.
    Fail(String),
}

/// A session command issued during one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    Initiate {
        session_id: SessionId,
        counterparty: Party,
        protocol: String,
        payload: Payload,
    },
    Send {
        session_id: SessionId,
        payload: Payload,
    },
    Close {
        session_id: SessionId,
    },
}

/// Business logic of one kind of flow.
pub trait FlowLogic: Send + Sync {
    fn resume(&self, ctx: &mut FiberContext<'_>, input: Resume) -> Result<FlowStep, FlowError>;
}

/// What flow logic can see and do during one step.
///
/// Session commands are buffered and applied in order once the step returns.
pub struct FiberContext<'a> {
    flow_id: &'a FlowId,
    identity: &'a Party,
    now: DateTime<Utc>,
    fiber: &'a mut FiberState,
    commands: Vec<SessionCommand>,
}

impl<'a> FiberContext<'a> {
    pub(crate) fn new(flow_id: &'a FlowId, identity: &'a Party, now: DateTime<Utc>, fiber: &'a mut FiberState) -> Self {
        Self {
            flow_id,
            identity,
            now,
            fiber,
            commands: Vec::new(),
        }
    }

    pub fn flow_id(&self) -> &FlowId {
        self.flow_id
    }

    /// The party this flow runs as.
    pub fn identity(&self) -> &Party {
        self.identity
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The persisted state, or `T::default()` before the first `set_state`.
    pub fn state<T: DeserializeOwned + Default>(&self) -> Result<T, FlowError> {
        if self.fiber.user_state.is_null() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(self.fiber.user_state.clone())?)
    }

    pub fn set_state<T: Serialize>(&mut self, state: &T) -> Result<(), FlowError> {
        self.fiber.user_state = serde_json::to_value(state)?;
        Ok(())
    }

    /// Opens a session to `counterparty`. The `Init` carries `payload`.
    pub fn initiate_session(&mut self, counterparty: Party, protocol: impl Into<String>, payload: Payload) -> SessionId {
        let session_id = self.fiber.next_session_id(self.flow_id);
        self.commands.push(SessionCommand::Initiate {
            session_id: session_id.clone(),
            counterparty,
            protocol: protocol.into(),
            payload,
        });
        session_id
    }

    pub fn send(&mut self, session_id: &SessionId, payload: Payload) {
        self.commands.push(SessionCommand::Send {
            session_id: session_id.clone(),
            payload,
        });
    }

    pub fn close_session(&mut self, session_id: &SessionId) {
        self.commands.push(SessionCommand::Close {
            session_id: session_id.clone(),
        });
    }

    pub(crate) fn into_commands(self) -> Vec<SessionCommand> {
        self.commands
    }
}
