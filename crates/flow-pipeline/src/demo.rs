//! Demo flows used by the binary and the scenario tests.

use flow_types::{ExternalCategory, Party, Payload, SessionId};
use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::logic::{FiberContext, FlowLogic, FlowStep, Resume};
use crate::registry::FlowRegistry;
use crate::services::PersistenceCommand;

pub const PING_FLOW: &str = "ping";
pub const PONG_FLOW: &str = "pong";
pub const SIGN_AND_STORE_FLOW: &str = "sign-and-store";

/// Session protocol spoken between ping and pong.
pub const PING_PROTOCOL: &str = "ping";

/// Registry with every demo flow and the pong responder.
pub fn demo_registry() -> FlowRegistry {
    FlowRegistry::new()
        .with_flow(PING_FLOW, PingFlow)
        .with_flow(PONG_FLOW, PongFlow)
        .with_flow(SIGN_AND_STORE_FLOW, SignAndStoreFlow)
        .with_responder(PING_PROTOCOL, PONG_FLOW)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingArgs {
    pub counterparty: Party,
    pub rounds: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PingState {
    session: Option<SessionId>,
    rounds: u32,
    sent: u32,
    replies: Vec<String>,
}

/// Sends `rounds` pings over one session and completes with the replies.
pub struct PingFlow;

impl FlowLogic for PingFlow {
    fn resume(&self, ctx: &mut FiberContext<'_>, input: Resume) -> Result<FlowStep, FlowError> {
        let mut state: PingState = ctx.state()?;

        match input {
            Resume::Start { args, .. } => {
                let args: PingArgs = args.to_json()?;
                if args.rounds == 0 {
                    return Ok(FlowStep::Fail("at least one round is required".into()));
                }
                let session = ctx.initiate_session(args.counterparty, PING_PROTOCOL, Payload::empty());
                ctx.send(&session, Payload::from("ping-1"));
                state.session = Some(session.clone());
                state.rounds = args.rounds;
                state.sent = 1;
                ctx.set_state(&state)?;
                Ok(FlowStep::Receive { session_id: session })
            }
            Resume::SessionData { session_id, payload } => {
                state.replies.push(payload.to_string_lossy());
                if state.sent < state.rounds {
                    state.sent += 1;
                    ctx.send(&session_id, Payload::from(format!("ping-{}", state.sent)));
                    ctx.set_state(&state)?;
                    return Ok(FlowStep::Receive { session_id });
                }
                ctx.close_session(&session_id);
                ctx.set_state(&state)?;
                Ok(FlowStep::Complete(Payload::from_json(&state.replies)?))
            }
            Resume::SessionClosed { .. } => Ok(FlowStep::Fail("counterparty closed the session early".into())),
            Resume::Error { message } => Ok(FlowStep::Fail(message)),
            other => Err(FlowError::Fatal(format!("ping cannot resume with {:?}", other))),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PongState {
    answered: u32,
}

/// Answers every `ping-n` with `pong-n` until the initiator closes.
pub struct PongFlow;

impl FlowLogic for PongFlow {
    fn resume(&self, ctx: &mut FiberContext<'_>, input: Resume) -> Result<FlowStep, FlowError> {
        let mut state: PongState = ctx.state()?;

        match input {
            Resume::Start {
                initiated_by: Some(by), ..
            } => Ok(FlowStep::Receive {
                session_id: by.session_id,
            }),
            Resume::Start { initiated_by: None, .. } => Ok(FlowStep::Fail("pong only runs as a responder".into())),
            Resume::SessionData { session_id, payload } => {
                let ping = payload.to_string_lossy();
                let round = ping.strip_prefix("ping-").unwrap_or(&ping);
                ctx.send(&session_id, Payload::from(format!("pong-{}", round)));
                state.answered += 1;
                ctx.set_state(&state)?;
                Ok(FlowStep::Receive { session_id })
            }
            Resume::SessionClosed { .. } => Ok(FlowStep::Complete(Payload::from(state.answered.to_string()))),
            Resume::Error { message } => Ok(FlowStep::Fail(message)),
            other => Err(FlowError::Fatal(format!("pong cannot resume with {:?}", other))),
        }
    }
}

/// Signs its arguments, stores the signature under the flow id and
/// completes with the signature.
pub struct SignAndStoreFlow;

impl FlowLogic for SignAndStoreFlow {
    fn resume(&self, ctx: &mut FiberContext<'_>, input: Resume) -> Result<FlowStep, FlowError> {
        match input {
            Resume::Start { args, .. } => Ok(FlowStep::CallExternal {
                category: ExternalCategory::Crypto,
                request: args,
            }),
            Resume::External {
                category: ExternalCategory::Crypto,
                value: signature,
            } => {
                ctx.set_state(&signature.to_string_lossy())?;
                let put = PersistenceCommand::Put {
                    key: ctx.flow_id().to_string(),
                    value: signature,
                };
                Ok(FlowStep::CallExternal {
                    category: ExternalCategory::Persistence,
                    request: Payload::from_json(&put)?,
                })
            }
            Resume::External {
                category: ExternalCategory::Persistence,
                ..
            } => {
                let signature: String = ctx.state()?;
                Ok(FlowStep::Complete(Payload::from(signature)))
            }
            Resume::Error { message } => Ok(FlowStep::Fail(message)),
            other => Err(FlowError::Fatal(format!("sign-and-store cannot resume with {:?}", other))),
        }
    }
}
