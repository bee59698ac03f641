//! Optimistic concurrency and termination.

use super::checkpoint;
use crate::{CheckpointStore, SqliteCheckpointStore, StoreError};
use chrono::{TimeDelta, Utc};
use flow_types::FlowId;

#[test]
fn stale_version_is_a_conflict() {
    let store = SqliteCheckpointStore::in_memory().unwrap();
    let flow_id = FlowId::from("f1");
    let cp = checkpoint("f1");
    let v1 = store.save(&flow_id, 0, Some(&cp), &[]).unwrap();
    let v2 = store.save(&flow_id, v1, Some(&cp), &[]).unwrap();
    assert_eq!(v2, 2);

    let err = store.save(&flow_id, v1, Some(&cp), &[]).unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionConflict {
            expected: 1,
            found: 2,
            ..
        }
    ));
    assert_eq!(store.load(&flow_id).unwrap().unwrap().version, 2);
}

#[test]
fn second_creation_is_a_conflict() {
    let store = SqliteCheckpointStore::in_memory().unwrap();
    let flow_id = FlowId::from("f1");
    store.save(&flow_id, 0, Some(&checkpoint("f1")), &[]).unwrap();
    assert!(matches!(
        store.save(&flow_id, 0, Some(&checkpoint("f1")), &[]),
        Err(StoreError::VersionConflict { .. })
    ));
}

#[test]
fn terminated_flow_cannot_be_recreated() {
    let store = SqliteCheckpointStore::in_memory().unwrap();
    let flow_id = FlowId::from("f1");
    let v1 = store.save(&flow_id, 0, Some(&checkpoint("f1")), &[]).unwrap();
    store.save(&flow_id, v1, None, &[]).unwrap();

    assert!(store.load(&flow_id).unwrap().is_none());
    assert!(store.is_terminated(&flow_id).unwrap());
    assert!(store.list_flows().unwrap().is_empty());
    assert!(matches!(
        store.save(&flow_id, 0, Some(&checkpoint("f1")), &[]),
        Err(StoreError::Terminated(_))
    ));
}

#[test]
fn pruned_termination_markers_are_forgotten() {
    let store = SqliteCheckpointStore::in_memory().unwrap();
    let flow_id = FlowId::from("f1");
    let v1 = store.save(&flow_id, 0, Some(&checkpoint("f1")), &[]).unwrap();
    store.save(&flow_id, v1, None, &[]).unwrap();

    // A cutoff in the past keeps the marker.
    assert_eq!(store.prune_terminated(Utc::now() - TimeDelta::hours(1)).unwrap(), 0);
    assert!(store.is_terminated(&flow_id).unwrap());

    assert_eq!(store.prune_terminated(Utc::now() + TimeDelta::seconds(1)).unwrap(), 1);
    assert!(!store.is_terminated(&flow_id).unwrap());
}
