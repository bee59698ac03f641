//! Output relay.
//!
//! Outputs are committed to the store's output log together with the
//! checkpoint. The relay publishes them afterwards, in commit order, and
//! removes them from the log. A crash between publish and removal means the
//! output is published again, so sinks must tolerate duplicates (every consumer in
//! the engine deduplicates by sequence number or request id).

use std::sync::Arc;
use std::time::Duration;

use flow_checkpoint::{LoggedOutput, OutputLog};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::error::{RelayError, RelayResult, SinkError};

/// Destination of relayed outputs, typically the message bus.
pub trait OutputSink: Send + Sync {
    fn publish(&self, output: &LoggedOutput) -> Result<(), SinkError>;
}

impl<T: OutputSink + ?Sized> OutputSink for Arc<T> {
    fn publish(&self, output: &LoggedOutput) -> Result<(), SinkError> {
        (**self).publish(output)
    }
}

/// A sink that records everything it is given. Useful for testing.
#[derive(Debug, Default)]
pub struct RecordingSink {
    outputs: Mutex<Vec<LoggedOutput>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<LoggedOutput> {
        self.outputs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.outputs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputSink for RecordingSink {
    fn publish(&self, output: &LoggedOutput) -> Result<(), SinkError> {
        self.outputs.lock().push(output.clone());
        Ok(())
    }
}

/// Moves committed outputs from the output log to a sink.
pub struct OutputRelay<L, K> {
    log: L,
    sink: K,
    batch_size: usize,
}

impl<L: OutputLog, K: OutputSink> OutputRelay<L, K> {
    pub fn new(log: L, sink: K, batch_size: usize) -> Self {
        Self {
            log,
            sink,
            batch_size: batch_size.max(1),
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Publishes one batch. Stops at the first rejected output; everything
    /// before it is still removed from the log.
    pub fn drain_once(&self) -> RelayResult<usize> {
        let pending = self.log.pending_outputs(self.batch_size)?;
        let mut delivered = Vec::with_capacity(pending.len());
        let mut failure = None;

        for output in &pending {
            match self.sink.publish(output) {
                Ok(()) => delivered.push(output.id),
                Err(source) => {
                    failure = Some(RelayError::Sink { id: output.id, source });
                    break;
                }
            }
        }

        if !delivered.is_empty() {
            self.log.mark_delivered(&delivered)?;
            debug!(count = delivered.len(), "Relayed outputs");
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(delivered.len()),
        }
    }

    /// Publishes until the log has nothing pending.
    pub fn drain(&self) -> RelayResult<usize> {
        let mut total = 0;
        loop {
            let count = self.drain_once()?;
            total += count;
            if count < self.batch_size {
                return Ok(total);
            }
        }
    }
}

impl<L, K> OutputRelay<L, K>
where
    L: OutputLog + 'static,
    K: OutputSink + 'static,
{
    /// Drains whenever `notify` fires, and at least every `interval`.
    pub async fn run(self: Arc<Self>, notify: Arc<Notify>, interval: Duration) {
        loop {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }

            let relay = self.clone();
            match tokio::task::spawn_blocking(move || relay.drain()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Output relay failed"),
                Err(e) => error!(error = %e, "Output relay task panicked"),
            }
        }
    }
}
