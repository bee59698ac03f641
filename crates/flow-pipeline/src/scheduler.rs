//! Wakeup scheduler.
//!
//! Turns `ScheduleWakeup` outputs into `Wakeup` events. A flow has at most
//! one pending wakeup; a request for an earlier time replaces a later one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flow_types::{Clock, FlowEvent, FlowEventPayload, FlowId, Wakeup};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct WakeupScheduler {
    pending: Mutex<HashMap<FlowId, DateTime<Utc>>>,
}

impl WakeupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a wakeup for `flow_id` at `fire_at`. The earliest request wins.
    pub fn schedule(&self, flow_id: FlowId, fire_at: DateTime<Utc>) {
        let mut pending = self.pending.lock();
        match pending.get(&flow_id) {
            Some(existing) if *existing <= fire_at => {
                trace!(flow_id = %flow_id, fire_at = %fire_at, "Keeping earlier wakeup");
            }
            _ => {
                pending.insert(flow_id, fire_at);
            }
        }
    }

    /// Removes and returns every wakeup due at `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<FlowEvent> {
        let mut pending = self.pending.lock();
        let mut due: Vec<(FlowId, DateTime<Utc>)> = pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (id.clone(), *at))
            .collect();
        for (id, _) in &due {
            pending.remove(id);
        }
        due.sort_by_key(|(_, at)| *at);

        due.into_iter()
            .map(|(flow_id, fire_at)| FlowEvent::new(flow_id, FlowEventPayload::Wakeup(Wakeup { fire_at })))
            .collect()
    }

    /// The earliest pending wakeup.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.pending.lock().values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers due wakeups to `events`, checking every `tick`.
    ///
    /// Returns once the receiving side is gone.
    pub async fn run(self: Arc<Self>, clock: Arc<dyn Clock>, events: UnboundedSender<FlowEvent>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            for event in self.take_due(clock.now()) {
                debug!(flow_id = %event.flow_id, "Firing wakeup");
                if events.send(event).is_err() {
                    return;
                }
            }
        }
    }
}
