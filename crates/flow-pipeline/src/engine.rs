//! Engine assembly.
//!
//! Wires the pipeline, the worker pool, the output relay, the wakeup
//! scheduler and the loopback bus into one running engine. A background
//! task forgets termination markers older than the configured retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use flow_checkpoint::{CheckpointStore, OutputLog, StoreResult};
use flow_types::{
    Clock, DeadLetterRecord, ExternalCategory, FlowEvent, FlowEventPayload, FlowId, FlowStatus, KillRequest, Party, Payload,
    StartFlowRequest, SystemClock,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::LoopbackBus;
use crate::config::EngineConfig;
use crate::error::{PipelineResult, PoolError};
use crate::pipeline::FlowEventPipeline;
use crate::registry::FlowRegistry;
use crate::relay::OutputRelay;
use crate::scheduler::WakeupScheduler;
use crate::services::ExternalService;
use crate::worker::FlowWorkerPool;

/// Longest the relay waits for a commit notification before polling.
const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Granularity of the wakeup scheduler.
const SCHEDULER_TICK: Duration = Duration::from_millis(20);

/// How often expired termination markers are pruned.
const TOMBSTONE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Poll interval of [`FlowEngine::wait_for_status`].
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct FlowEngine {
    events: UnboundedSender<FlowEvent>,
    bus: Arc<LoopbackBus>,
    scheduler: Arc<WakeupScheduler>,
    clock: Arc<dyn Clock>,
    pool: Arc<FlowWorkerPool>,
    tasks: Vec<JoinHandle<()>>,
}

impl FlowEngine {
    /// Starts an engine over `store`.
    ///
    /// Every flow found in the store gets an immediate wakeup, which resends
    /// whatever it was still waiting on before the restart.
    pub fn start<S>(
        store: Arc<S>,
        registry: FlowRegistry,
        config: EngineConfig,
        services: Vec<(ExternalCategory, Arc<dyn ExternalService>)>,
    ) -> PipelineResult<Self>
    where
        S: CheckpointStore + OutputLog + 'static,
    {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (events, inbound) = unbounded_channel();
        let scheduler = Arc::new(WakeupScheduler::new());

        let bus = services.into_iter().fold(
            LoopbackBus::new(events.clone(), scheduler.clone(), clock.clone()),
            |bus, (category, service)| bus.with_service(category, service),
        );
        let bus = Arc::new(bus);

        let recovered = store.list_flows()?;
        for flow_id in &recovered {
            scheduler.schedule(flow_id.clone(), clock.now());
        }
        if !recovered.is_empty() {
            info!(flows = recovered.len(), "Recovered flows from store");
        }

        let committed = Arc::new(Notify::new());
        let retention = config.tombstone_retention;
        let relay = Arc::new(OutputRelay::new(store.clone(), bus.clone(), config.relay_batch_size));
        let pruned_store = store.clone();
        let pipeline = Arc::new(FlowEventPipeline::with_clock(store, registry, config, clock.clone()));
        let pool = Arc::new(FlowWorkerPool::start(pipeline, committed.clone()));

        // Outputs left undelivered by a previous run go out first.
        committed.notify_one();

        let tasks = vec![
            tokio::spawn(relay.run(committed, RELAY_POLL_INTERVAL)),
            tokio::spawn(scheduler.clone().run(clock.clone(), events.clone(), SCHEDULER_TICK)),
            tokio::spawn(dispatch(inbound, pool.clone())),
            tokio::spawn(prune_tombstones(pruned_store, clock.clone(), retention)),
        ];

        Ok(Self {
            events,
            bus,
            scheduler,
            clock,
            pool,
            tasks,
        })
    }

    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &WakeupScheduler {
        &self.scheduler
    }

    /// Events the worker pool could not commit.
    pub fn parked_events(&self) -> Vec<DeadLetterRecord> {
        self.pool.parked().list()
    }

    /// Resubmits every parked event.
    pub async fn replay_parked(&self) -> Result<usize, PoolError> {
        self.pool.replay_parked().await
    }

    /// Queues an inbound event.
    pub fn submit(&self, event: FlowEvent) -> Result<(), PoolError> {
        self.events.send(event).map_err(|_| PoolError::Closed)
    }

    /// Starts a new flow and returns its id.
    pub fn start_flow(&self, flow_name: &str, identity: Party, args: Payload) -> Result<FlowId, PoolError> {
        let flow_id = FlowId::new();
        self.submit(FlowEvent::new(
            flow_id.clone(),
            FlowEventPayload::StartFlow(StartFlowRequest {
                flow_name: flow_name.to_string(),
                identity,
                args,
                requested_at: self.clock.now(),
            }),
        ))?;
        Ok(flow_id)
    }

    pub fn kill(&self, flow_id: &FlowId, reason: impl Into<String>) -> Result<(), PoolError> {
        self.submit(FlowEvent::new(
            flow_id.clone(),
            FlowEventPayload::Kill(KillRequest { reason: reason.into() }),
        ))
    }

    /// Waits until `flow_id` reports a terminal status, or `timeout` passes.
    pub async fn wait_for_status(&self, flow_id: &FlowId, timeout: Duration) -> Option<FlowStatus> {
        let started = Utc::now();
        loop {
            if let Some(status) = self.bus.status_of(flow_id).filter(FlowStatus::is_terminal) {
                return Some(status);
            }
            if flow_types::elapsed(Utc::now(), started) >= timeout {
                return None;
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    /// Stops the background tasks and drains the worker pool.
    ///
    /// Outputs committed but not yet relayed stay in the store and go out
    /// on the next start.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        match Arc::try_unwrap(self.pool) {
            Ok(pool) => pool.shutdown().await,
            Err(_) => warn!("Worker pool still referenced, not waiting for it"),
        }
        info!("Flow engine stopped");
    }
}

/// Feeds events from the bus into the worker pool.
async fn dispatch(mut inbound: UnboundedReceiver<FlowEvent>, pool: Arc<FlowWorkerPool>) {
    while let Some(event) = inbound.recv().await {
        if pool.submit(event).await.is_err() {
            warn!("Worker pool closed, dropping inbound events");
            return;
        }
    }
}

/// Forgets flows that terminated more than `retention` before `now`.
fn prune_expired<S: CheckpointStore + ?Sized>(store: &S, now: DateTime<Utc>, retention: Duration) -> StoreResult<usize> {
    let Some(cutoff) = TimeDelta::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
    else {
        return Ok(0);
    };
    store.prune_terminated(cutoff)
}

async fn prune_tombstones<S>(store: Arc<S>, clock: Arc<dyn Clock>, retention: Duration)
where
    S: CheckpointStore + 'static,
{
    let mut ticker = tokio::time::interval(TOMBSTONE_PRUNE_INTERVAL);
    loop {
        ticker.tick().await;
        let store = store.clone();
        let now = clock.now();
        match tokio::task::spawn_blocking(move || prune_expired(store.as_ref(), now, retention)).await {
            Ok(Ok(removed)) => debug!(removed = removed, "Tombstone prune pass finished"),
            Ok(Err(e)) => warn!(error = %e, "Pruning termination markers failed"),
            Err(e) => warn!(error = %e, "Tombstone prune task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_checkpoint::{FlowCheckpoint, SqliteCheckpointStore};

    fn terminated_store(flow: &FlowId) -> SqliteCheckpointStore {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let checkpoint = FlowCheckpoint::new(flow.clone(), "payment", Party::from("alice"), Utc::now());
        let version = store.save(flow, 0, Some(&checkpoint), &[]).unwrap();
        store.save(flow, version, None, &[]).unwrap();
        store
    }

    #[test]
    fn test_recent_termination_markers_survive_pruning() {
        let flow = FlowId::from("f-recent");
        let store = terminated_store(&flow);

        assert_eq!(prune_expired(&store, Utc::now(), Duration::from_secs(3600)).unwrap(), 0);
        assert!(store.is_terminated(&flow).unwrap());
    }

    #[test]
    fn test_expired_termination_markers_are_pruned() {
        let flow = FlowId::from("f-expired");
        let store = terminated_store(&flow);

        let later = Utc::now() + TimeDelta::hours(2);
        assert_eq!(prune_expired(&store, later, Duration::from_secs(3600)).unwrap(), 1);
        assert!(!store.is_terminated(&flow).unwrap());
    }

    #[test]
    fn test_unbounded_retention_prunes_nothing() {
        let flow = FlowId::from("f-forever");
        let store = terminated_store(&flow);

        assert_eq!(prune_expired(&store, Utc::now(), Duration::MAX).unwrap(), 0);
        assert!(store.is_terminated(&flow).unwrap());
    }
}
