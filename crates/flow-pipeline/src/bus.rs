//! In-process loopback bus.
//!
//! Connects flows of different parties running in one engine. Session
//! messages go to the destination party's flow, external requests to the
//! registered services, wakeups to the scheduler. The most recent status
//! updates and dead letters are kept for inspection. Reply routes of a flow
//! that reported a terminal status are retired, and only the most recently
//! retired ones are kept so late messages still reach the finished flow and
//! get acknowledged.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use flow_checkpoint::LoggedOutput;
use flow_types::{
    Clock, DeadLetterRecord, ExternalCategory, ExternalResponse, FlowEvent, FlowEventPayload, FlowId, FlowStatus,
    FlowStatusUpdate, OutputRecord, Party, SessionId,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::error::SinkError;
use crate::relay::OutputSink;
use crate::scheduler::WakeupScheduler;
use crate::services::ExternalService;

/// Decides whether an output is delivered. Used to simulate message loss.
pub type DeliveryFilter = Box<dyn Fn(&OutputRecord) -> bool + Send + Sync>;

/// Status updates, dead letters and retired routes kept before the oldest are discarded.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

fn push_bounded<T>(history: &mut VecDeque<T>, item: T, limit: usize) {
    while history.len() >= limit.max(1) {
        history.pop_front();
    }
    history.push_back(item);
}

/// Id of the flow that answers `session_id` on behalf of `party`.
///
/// Derived from the session so a redelivered `Init` reaches the same flow.
pub fn responder_flow_id(party: &Party, session_id: &SessionId) -> FlowId {
    FlowId::from_string(format!("{}@{}", session_id, party))
}

pub struct LoopbackBus {
    events: UnboundedSender<FlowEvent>,
    scheduler: Arc<WakeupScheduler>,
    clock: Arc<dyn Clock>,
    services: HashMap<ExternalCategory, Arc<dyn ExternalService>>,
    routes: Mutex<HashMap<(Party, SessionId), FlowId>>,
    retired_routes: Mutex<VecDeque<(Party, SessionId)>>,
    statuses: Mutex<VecDeque<FlowStatusUpdate>>,
    dead_letters: Mutex<VecDeque<DeadLetterRecord>>,
    history_limit: usize,
    filter: Option<DeliveryFilter>,
}

impl LoopbackBus {
    pub fn new(events: UnboundedSender<FlowEvent>, scheduler: Arc<WakeupScheduler>, clock: Arc<dyn Clock>) -> Self {
        Self {
            events,
            scheduler,
            clock,
            services: HashMap::new(),
            routes: Mutex::new(HashMap::new()),
            retired_routes: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            filter: None,
        }
    }

    pub fn with_service(mut self, category: ExternalCategory, service: Arc<dyn ExternalService>) -> Self {
        self.services.insert(category, service);
        self
    }

    /// Drops every output for which `filter` returns false.
    pub fn with_filter(mut self, filter: impl Fn(&OutputRecord) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Keeps at most `limit` status updates, dead letters and retired routes.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// The retained status updates, oldest first.
    pub fn statuses(&self) -> Vec<FlowStatusUpdate> {
        self.statuses.lock().iter().cloned().collect()
    }

    /// Latest status of a flow.
    pub fn status_of(&self, flow_id: &FlowId) -> Option<FlowStatus> {
        self.statuses
            .lock()
            .iter()
            .rev()
            .find(|update| &update.flow_id == flow_id)
            .map(|update| update.status.clone())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    /// Removes and returns the retained dead letters.
    pub fn take_dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters.lock().drain(..).collect()
    }

    /// Number of sessions with a reply route.
    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }

    fn route(&self, party: &Party, session_id: &SessionId) -> FlowId {
        self.routes
            .lock()
            .get(&(party.clone(), session_id.clone()))
            .cloned()
            .unwrap_or_else(|| responder_flow_id(party, session_id))
    }

    /// Queues the routes owned by a finished flow for removal.
    fn retire_routes(&self, flow_id: &FlowId) {
        let mut routes = self.routes.lock();
        let mut retired = self.retired_routes.lock();
        retired.extend(
            routes
                .iter()
                .filter(|(_, owner)| *owner == flow_id)
                .map(|(key, _)| key.clone()),
        );
        while retired.len() > self.history_limit {
            if let Some(key) = retired.pop_front() {
                routes.remove(&key);
            }
        }
    }

    fn send(&self, event: FlowEvent) -> Result<(), SinkError> {
        self.events
            .send(event)
            .map_err(|_| SinkError::new("event channel closed"))
    }
}

impl OutputSink for LoopbackBus {
    fn publish(&self, output: &LoggedOutput) -> Result<(), SinkError> {
        if let Some(filter) = &self.filter {
            if !filter(&output.record) {
                debug!(id = output.id, topic = output.record.topic(), "Dropping output");
                return Ok(());
            }
        }

        match &output.record {
            OutputRecord::Session(event) => {
                // Replies to this session go back to the sending flow.
                self.routes
                    .lock()
                    .insert((event.source.clone(), event.session_id.clone()), output.flow_id.clone());
                let target = self.route(&event.destination, &event.session_id);
                debug!(
                    session_id = %event.session_id,
                    kind = event.body.kind(),
                    sequence = event.sequence_num,
                    target = %target,
                    "Routing session message"
                );
                self.send(FlowEvent::new(
                    target,
                    FlowEventPayload::Session(event.clone().into_inbound()),
                ))
            }
            OutputRecord::ExternalRequest(request) => {
                let Some(service) = self.services.get(&request.category) else {
                    warn!(category = %request.category, request_id = %request.request_id, "No service for category");
                    return Ok(());
                };
                let outcome = service.handle(request);
                self.send(FlowEvent::new(
                    request.flow_id.clone(),
                    FlowEventPayload::ExternalResponse(ExternalResponse {
                        request_id: request.request_id.clone(),
                        category: request.category,
                        outcome,
                        timestamp: self.clock.now(),
                    }),
                ))
            }
            OutputRecord::ScheduleWakeup(wakeup) => {
                self.scheduler.schedule(wakeup.flow_id.clone(), wakeup.fire_at);
                Ok(())
            }
            OutputRecord::FlowStatus(update) => {
                info!(flow_id = %update.flow_id, flow_name = %update.flow_name, status = ?update.status, "Flow status");
                if update.status.is_terminal() {
                    self.retire_routes(&update.flow_id);
                }
                push_bounded(&mut self.statuses.lock(), update.clone(), self.history_limit);
                Ok(())
            }
            OutputRecord::DeadLetter(record) => {
                error!(flow_id = %record.event.flow_id, reason = %record.reason, "Dead letter");
                push_bounded(&mut self.dead_letters.lock(), record.clone(), self.history_limit);
                Ok(())
            }
        }
    }
}
