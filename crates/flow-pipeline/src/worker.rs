//! Partitioned worker pool.
//!
//! Each event is routed by a hash of its flow id to one partition. A
//! partition processes its events one at a time, so two events of the same
//! flow never run concurrently while distinct flows proceed in parallel.
//!
//! An event the store keeps refusing is retried with exponential backoff and
//! then parked. Parked events stay listed on the pool until
//! [`FlowWorkerPool::replay_parked`] submits them again.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use std::time::Duration;

use flow_checkpoint::CheckpointStore;
use flow_types::{DeadLetterRecord, FlowEvent, FlowId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::pipeline::{FlowEventPipeline, PipelineOutcome};

/// Events buffered per partition before `submit` waits.
const PARTITION_CAPACITY: usize = 1024;

/// Upper bound on the wait between two attempts after a store failure.
const MAX_STORE_BACKOFF: Duration = Duration::from_secs(5);

/// Events that could not be committed.
#[derive(Debug, Default)]
pub struct ParkedEvents {
    events: Mutex<Vec<DeadLetterRecord>>,
}

impl ParkedEvents {
    fn park(&self, record: DeadLetterRecord) {
        self.events.lock().push(record);
    }

    /// Snapshot of the parked events, oldest first.
    pub fn list(&self) -> Vec<DeadLetterRecord> {
        self.events.lock().clone()
    }

    /// Removes and returns every parked event.
    pub fn take(&self) -> Vec<DeadLetterRecord> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

pub struct FlowWorkerPool {
    senders: Vec<mpsc::Sender<FlowEvent>>,
    workers: Vec<JoinHandle<()>>,
    parked: Arc<ParkedEvents>,
}

impl FlowWorkerPool {
    /// Spawns one worker per configured partition.
    ///
    /// `committed` is notified after every commit so the output relay can
    /// publish without waiting for its poll interval.
    pub fn start<S>(pipeline: Arc<FlowEventPipeline<S>>, committed: Arc<Notify>) -> Self
    where
        S: CheckpointStore + 'static,
    {
        let partitions = pipeline.config().partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);
        let parked = Arc::new(ParkedEvents::default());

        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(PARTITION_CAPACITY);
            senders.push(tx);
            workers.push(tokio::spawn(run_partition(
                partition,
                pipeline.clone(),
                rx,
                committed.clone(),
                parked.clone(),
            )));
        }

        info!(partitions = partitions, "Started flow worker pool");
        Self {
            senders,
            workers,
            parked,
        }
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// The partition that processes `flow_id`.
    pub fn partition_for(&self, flow_id: &FlowId) -> usize {
        let mut hasher = DefaultHasher::new();
        flow_id.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queues an event on its flow's partition.
    pub async fn submit(&self, event: FlowEvent) -> Result<(), PoolError> {
        let partition = self.partition_for(&event.flow_id);
        self.senders[partition]
            .send(event)
            .await
            .map_err(|_| PoolError::Closed)
    }

    pub fn parked(&self) -> &ParkedEvents {
        &self.parked
    }

    /// Resubmits every parked event and returns how many were queued.
    ///
    /// If the pool closes midway, the events not yet queued are parked again.
    pub async fn replay_parked(&self) -> Result<usize, PoolError> {
        let mut records = self.parked.take().into_iter();
        let mut replayed = 0;
        while let Some(record) = records.next() {
            let event = record.event.clone();
            if let Err(e) = self.submit(event).await {
                self.parked.park(record);
                for rest in records.by_ref() {
                    self.parked.park(rest);
                }
                return Err(e);
            }
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed = replayed, "Replayed parked events");
        }
        Ok(replayed)
    }

    /// Stops accepting events and waits for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Partition worker panicked");
            }
        }
        info!("Flow worker pool stopped");
    }
}

async fn run_partition<S>(
    partition: usize,
    pipeline: Arc<FlowEventPipeline<S>>,
    mut events: mpsc::Receiver<FlowEvent>,
    committed: Arc<Notify>,
    parked: Arc<ParkedEvents>,
) where
    S: CheckpointStore + 'static,
{
    debug!(partition = partition, "Partition worker started");
    while let Some(event) = events.recv().await {
        if let Some(reason) = deliver(&pipeline, &event, &committed).await {
            parked.park(DeadLetterRecord {
                event,
                reason,
                timestamp: pipeline.clock().now(),
            });
        }
    }
    debug!(partition = partition, "Partition worker stopped");
}

/// Wait before the next attempt after `failures` consecutive store failures.
fn store_backoff(retry_delay: Duration, failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    retry_delay.saturating_mul(factor).min(MAX_STORE_BACKOFF)
}

/// Processes one event, redelivering it until it is no longer retried.
///
/// Returns the reason when the event could not be committed and must be parked.
async fn deliver<S>(pipeline: &Arc<FlowEventPipeline<S>>, event: &FlowEvent, committed: &Notify) -> Option<String>
where
    S: CheckpointStore + 'static,
{
    let retry_delay = pipeline.config().retry_delay;
    let max_store_failures = pipeline.config().max_retry_attempts;
    let mut store_failures = 0;

    loop {
        let worker_pipeline = pipeline.clone();
        let attempt = event.clone();
        let result = tokio::task::spawn_blocking(move || worker_pipeline.process(attempt)).await;

        match result {
            Ok(Ok(PipelineOutcome::Retry)) => {
                debug!(flow_id = %event.flow_id, delay_ms = retry_delay.as_millis() as u64, "Redelivering event");
                tokio::time::sleep(retry_delay).await;
            }
            Ok(Ok(PipelineOutcome::Ignored)) => return None,
            Ok(Ok(_)) => {
                committed.notify_one();
                return None;
            }
            Ok(Err(e)) => {
                store_failures += 1;
                if store_failures > max_store_failures {
                    error!(
                        flow_id = %event.flow_id,
                        event_kind = event.kind(),
                        attempt = store_failures,
                        error = %e,
                        "Parking event after repeated store failures"
                    );
                    return Some(format!("store failed {} times: {}", store_failures, e));
                }
                let backoff = store_backoff(retry_delay, store_failures);
                warn!(
                    flow_id = %event.flow_id,
                    attempt = store_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Store failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                error!(flow_id = %event.flow_id, event_kind = event.kind(), error = %e, "Pipeline task panicked, parking event");
                return Some(format!("pipeline panicked: {}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backoff_doubles_up_to_the_cap() {
        let base = Duration::from_millis(100);
        assert_eq!(store_backoff(base, 1), Duration::from_millis(100));
        assert_eq!(store_backoff(base, 2), Duration::from_millis(200));
        assert_eq!(store_backoff(base, 4), Duration::from_millis(800));
        assert_eq!(store_backoff(base, 10), MAX_STORE_BACKOFF);
        assert_eq!(store_backoff(Duration::ZERO, 3), Duration::ZERO);
    }
}
