//! Store contracts.

use chrono::{DateTime, Utc};
use flow_types::{FlowId, OutputRecord};

use crate::checkpoint::FlowCheckpoint;
use crate::error::StoreResult;

/// Durable home of flow checkpoints.
///
/// One single-writer per flow id is assumed (the bus partitions by flow id).
/// The version check only detects violations of that assumption.
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint of a running flow.
    fn load(&self, flow_id: &FlowId) -> StoreResult<Option<FlowCheckpoint>>;

    /// Commits the next state of a flow together with its outputs.
    ///
    /// `expected_version` is the version that was loaded (0 for a new flow).
    /// `None` removes the checkpoint and marks the flow as terminated.
    /// Either the checkpoint write and every output commit, or nothing does.
    /// Returns the new version.
    fn save(
        &self,
        flow_id: &FlowId,
        expected_version: u64,
        checkpoint: Option<&FlowCheckpoint>,
        outputs: &[OutputRecord],
    ) -> StoreResult<u64>;

    /// Whether the flow has run to termination.
    fn is_terminated(&self, flow_id: &FlowId) -> StoreResult<bool>;

    /// Ids of every flow with a live checkpoint.
    fn list_flows(&self) -> StoreResult<Vec<FlowId>>;

    /// Forgets flows that terminated before `before`.
    ///
    /// A forgotten flow no longer answers late session messages, so the
    /// cutoff must lie well past the longest resend horizon.
    fn prune_terminated(&self, before: DateTime<Utc>) -> StoreResult<usize>;
}

/// An output record waiting in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedOutput {
    pub id: i64,
    pub flow_id: FlowId,
    pub record: OutputRecord,
    pub created_at: DateTime<Utc>,
}

/// Relay side of the output log.
pub trait OutputLog: Send + Sync {
    /// Undelivered outputs in commit order.
    fn pending_outputs(&self, limit: usize) -> StoreResult<Vec<LoggedOutput>>;

    /// Removes outputs that were handed to the bus. Unknown ids are skipped.
    fn mark_delivered(&self, ids: &[i64]) -> StoreResult<usize>;
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<T> {
    fn load(&self, flow_id: &FlowId) -> StoreResult<Option<FlowCheckpoint>> {
        (**self).load(flow_id)
    }

    fn save(
        &self,
        flow_id: &FlowId,
        expected_version: u64,
        checkpoint: Option<&FlowCheckpoint>,
        outputs: &[OutputRecord],
    ) -> StoreResult<u64> {
        (**self).save(flow_id, expected_version, checkpoint, outputs)
    }

    fn is_terminated(&self, flow_id: &FlowId) -> StoreResult<bool> {
        (**self).is_terminated(flow_id)
    }

    fn list_flows(&self) -> StoreResult<Vec<FlowId>> {
        (**self).list_flows()
    }

    fn prune_terminated(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        (**self).prune_terminated(before)
    }
}

impl<T: OutputLog + ?Sized> OutputLog for std::sync::Arc<T> {
    fn pending_outputs(&self, limit: usize) -> StoreResult<Vec<LoggedOutput>> {
        (**self).pending_outputs(limit)
    }

    fn mark_delivered(&self, ids: &[i64]) -> StoreResult<usize> {
        (**self).mark_delivered(ids)
    }
}
