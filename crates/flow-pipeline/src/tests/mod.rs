//! Pipeline scenario suites.
//!
//! Scenarios run on a synchronous [`Network`]: one pipeline, the loopback
//! bus and a manual clock. Events are processed one at a time until nothing
//! is left, and time only moves when a test advances it.
//!
//! - `sessions.rs` - two-party session flows
//! - `outbox.rs`   - external requests through the outbox
//! - `failures.rs` - retries, business errors, kill and restart
//! - `timers.rs`   - sleeping flows

mod outbox;

use std::sync::Arc;
use std::time::Duration;

use flow_checkpoint::{CheckpointStore, FlowCheckpoint, SqliteCheckpointStore};
use flow_types::{
    Clock, ExternalCategory, FlowEvent, FlowEventPayload, FlowId, FlowStatus, ManualClock, OutputRecord, Party,
    Payload, StartFlowRequest, Wakeup,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::bus::{DeliveryFilter, LoopbackBus};
use crate::config::EngineConfig;
use crate::demo::PingArgs;
use crate::pipeline::{FlowEventPipeline, PipelineOutcome};
use crate::registry::FlowRegistry;
use crate::relay::OutputRelay;
use crate::scheduler::WakeupScheduler;
use crate::services::{DemoSigningService, ExternalService, InMemoryPersistenceService};

pub(crate) const SIGNING_KEY: &str = "test-key";
pub(crate) const START_MILLIS: i64 = 1_700_000_000_000;

/// Events processed before a scenario is considered stuck.
const MAX_EVENTS: usize = 10_000;

type Store = Arc<SqliteCheckpointStore>;

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        session_resend_window: Duration::from_millis(500),
        external_resend_window: Duration::from_millis(1000),
        max_retry_attempts: 3,
        retry_delay: Duration::ZERO,
        ..EngineConfig::default()
    }
}

pub(crate) fn ping_args(counterparty: &str, rounds: u32) -> Payload {
    Payload::from_json(&PingArgs {
        counterparty: Party::from(counterparty),
        rounds,
    })
    .unwrap()
}

pub(crate) struct NetworkBuilder {
    registry: FlowRegistry,
    config: EngineConfig,
    store: Option<Store>,
    clock: Arc<ManualClock>,
    filter: Option<DeliveryFilter>,
    services: Vec<(ExternalCategory, Arc<dyn ExternalService>)>,
}

impl NetworkBuilder {
    pub(crate) fn config(mut self, update: impl FnOnce(&mut EngineConfig)) -> Self {
        update(&mut self.config);
        self
    }

    pub(crate) fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub(crate) fn clock_at(mut self, millis: i64) -> Self {
        self.clock = Arc::new(ManualClock::at_millis(millis));
        self
    }

    /// Drops outputs for which `filter` returns false.
    pub(crate) fn filter(mut self, filter: impl Fn(&OutputRecord) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub(crate) fn service(mut self, category: ExternalCategory, service: Arc<dyn ExternalService>) -> Self {
        self.services.push((category, service));
        self
    }

    pub(crate) fn build(self) -> Network {
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteCheckpointStore::in_memory().unwrap()),
        };
        let clock: Arc<dyn Clock> = self.clock.clone();
        let (tx, events) = unbounded_channel();
        let scheduler = Arc::new(WakeupScheduler::new());
        let persistence = Arc::new(InMemoryPersistenceService::new());

        let mut bus = LoopbackBus::new(tx.clone(), scheduler.clone(), clock.clone())
            .with_service(ExternalCategory::Crypto, Arc::new(DemoSigningService::new(SIGNING_KEY)))
            .with_service(ExternalCategory::Persistence, persistence.clone());
        for (category, service) in self.services {
            bus = bus.with_service(category, service);
        }
        if let Some(filter) = self.filter {
            bus = bus.with_filter(filter);
        }
        let bus = Arc::new(bus);

        Network {
            clock: self.clock,
            store: store.clone(),
            pipeline: FlowEventPipeline::with_clock(store.clone(), self.registry, self.config, clock),
            relay: OutputRelay::new(store, bus.clone(), 16),
            bus,
            scheduler,
            persistence,
            tx,
            events,
            outcomes: Vec::new(),
            started: 0,
        }
    }
}

pub(crate) struct Network {
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) store: Store,
    pub(crate) pipeline: FlowEventPipeline<Store>,
    pub(crate) relay: OutputRelay<Store, Arc<LoopbackBus>>,
    pub(crate) bus: Arc<LoopbackBus>,
    pub(crate) scheduler: Arc<WakeupScheduler>,
    pub(crate) persistence: Arc<InMemoryPersistenceService>,
    tx: UnboundedSender<FlowEvent>,
    events: UnboundedReceiver<FlowEvent>,
    /// Every processed event with its outcome, in processing order.
    pub(crate) outcomes: Vec<(FlowEvent, PipelineOutcome)>,
    started: usize,
}

impl Network {
    pub(crate) fn builder(registry: FlowRegistry) -> NetworkBuilder {
        NetworkBuilder {
            registry,
            config: test_config(),
            store: None,
            clock: Arc::new(ManualClock::at_millis(START_MILLIS)),
            filter: None,
            services: Vec::new(),
        }
    }

    pub(crate) fn new(registry: FlowRegistry) -> Self {
        Self::builder(registry).build()
    }

    /// Queues a `StartFlow` and returns the new flow's id.
    pub(crate) fn start(&mut self, flow_name: &str, identity: &str, args: Payload) -> FlowId {
        self.started += 1;
        let flow_id = FlowId::from(format!("{}-{}", flow_name, self.started));
        self.submit(FlowEvent::new(
            flow_id.clone(),
            FlowEventPayload::StartFlow(StartFlowRequest {
                flow_name: flow_name.to_string(),
                identity: Party::from(identity),
                args,
                requested_at: self.clock.now(),
            }),
        ));
        flow_id
    }

    pub(crate) fn submit(&self, event: FlowEvent) {
        self.tx.send(event).unwrap();
    }

    /// Processes events and relays outputs until both are exhausted.
    ///
    /// Retried events are redelivered at the back of the queue.
    pub(crate) fn run_until_idle(&mut self) {
        for _ in 0..MAX_EVENTS {
            self.relay.drain().unwrap();
            let Ok(event) = self.events.try_recv() else {
                return;
            };
            let outcome = self.pipeline.process(event.clone()).unwrap();
            if outcome == PipelineOutcome::Retry {
                self.submit(event.clone());
            }
            self.outcomes.push((event, outcome));
        }
        panic!("network did not go idle within {} events", MAX_EVENTS);
    }

    /// Moves the clock, fires due wakeups and runs until idle.
    pub(crate) fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        for event in self.scheduler.take_due(self.clock.now()) {
            self.submit(event);
        }
        self.run_until_idle();
    }

    /// Wakes every stored flow, as an engine does after a restart.
    pub(crate) fn recover(&mut self) {
        for flow_id in self.store.list_flows().unwrap() {
            self.submit(FlowEvent::new(
                flow_id,
                FlowEventPayload::Wakeup(Wakeup {
                    fire_at: self.clock.now(),
                }),
            ));
        }
        self.run_until_idle();
    }

    pub(crate) fn status(&self, flow_id: &FlowId) -> Option<FlowStatus> {
        self.bus.status_of(flow_id)
    }

    pub(crate) fn checkpoint(&self, flow_id: &FlowId) -> Option<FlowCheckpoint> {
        self.store.load(flow_id).unwrap()
    }

    /// Outputs committed for `flow_id`, in commit order.
    pub(crate) fn committed_outputs(&self, flow_id: &FlowId) -> Vec<OutputRecord> {
        self.outcomes
            .iter()
            .filter(|(event, _)| &event.flow_id == flow_id)
            .flat_map(|(_, outcome)| match outcome {
                PipelineOutcome::Committed { outputs, .. } | PipelineOutcome::DeadLettered { outputs } => {
                    outputs.clone()
                }
                PipelineOutcome::Retry | PipelineOutcome::Ignored => Vec::new(),
            })
            .collect()
    }

    /// Outcomes of events addressed to `flow_id`.
    pub(crate) fn outcomes_of(&self, flow_id: &FlowId) -> Vec<PipelineOutcome> {
        self.outcomes
            .iter()
            .filter(|(event, _)| &event.flow_id == flow_id)
            .map(|(_, outcome)| outcome.clone())
            .collect()
    }
}
