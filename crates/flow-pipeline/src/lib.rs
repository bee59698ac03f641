//! # flow-pipeline
//!
//! Applies one inbound event to one flow checkpoint and commits the result
//! atomically.
//!
//! ## Processing one event
//!
//! ```text
//! FlowEvent ─▶ FlowEventPipeline::process
//!                ├─ load checkpoint
//!                ├─ handler (start | session | external | wakeup | kill)
//!                ├─ fiber: FlowLogic::resume until the flow suspends
//!                ├─ post-process: acks, resends, next wakeup
//!                └─ save(checkpoint | None, outputs)
//! ```
//!
//! Errors raised anywhere on that path go through the
//! [`ExceptionHandlerChain`]: transient errors roll back and redeliver,
//! business errors are handed to the flow logic, fatal errors terminate the
//! flow and dead-letter the event.
//!
//! ## Running
//!
//! [`FlowEngine`] wires the pipeline to a [`FlowWorkerPool`], an
//! [`OutputRelay`], a [`WakeupScheduler`] and the in-process
//! [`LoopbackBus`].

pub mod bus;
pub mod config;
pub mod context;
pub mod demo;
pub mod engine;
mod error;
pub mod exception;
mod executor;
mod fiber;
mod handlers;
pub mod logic;
pub mod pipeline;
mod post_process;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod services;
pub mod worker;

#[cfg(test)]
mod tests;

pub use bus::{responder_flow_id, LoopbackBus};
pub use config::EngineConfig;
pub use context::{FlowContinuation, FlowEventContext};
pub use engine::FlowEngine;
pub use error::{
    ConfigError, ConfigResult, FlowError, FlowEventError, PipelineError, PipelineResult, PoolError, RelayError,
    RelayResult, SinkError,
};
pub use exception::{
    BusinessExceptionHandler, ExceptionHandler, ExceptionHandlerChain, FatalExceptionHandler,
    TransientExceptionHandler,
};
pub use logic::{FiberContext, FlowLogic, FlowStep, InitiatedBy, Resume};
pub use pipeline::{FlowEventPipeline, PipelineOutcome};
pub use registry::FlowRegistry;
pub use relay::{OutputRelay, OutputSink, RecordingSink};
pub use scheduler::WakeupScheduler;
pub use services::{DemoSigningService, ExternalService, InMemoryPersistenceService, PersistenceCommand};
pub use worker::{FlowWorkerPool, ParkedEvents};
