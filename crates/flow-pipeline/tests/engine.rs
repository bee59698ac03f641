//! End-to-end runs of the engine with its worker pool, relay and scheduler.

use std::sync::Arc;
use std::time::Duration;

use flow_checkpoint::{CheckpointStore, SqliteCheckpointStore};
use flow_pipeline::demo::{demo_registry, PingArgs, PING_FLOW, SIGN_AND_STORE_FLOW};
use flow_pipeline::{
    DemoSigningService, EngineConfig, ExternalService, FlowEngine, FlowWorkerPool, InMemoryPersistenceService,
};
use flow_types::{ExternalCategory, FlowId, FlowStatus, Party, Payload};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn services(persistence: Arc<InMemoryPersistenceService>) -> Vec<(ExternalCategory, Arc<dyn ExternalService>)> {
    vec![
        (
            ExternalCategory::Crypto,
            Arc::new(DemoSigningService::new("engine-key")) as Arc<dyn ExternalService>,
        ),
        (ExternalCategory::Persistence, persistence as Arc<dyn ExternalService>),
    ]
}

fn config() -> EngineConfig {
    EngineConfig {
        partitions: 3,
        session_resend_window: Duration::from_millis(200),
        external_resend_window: Duration::from_millis(200),
        retry_delay: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_runs_ping_pong() {
    let store = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
    let engine = FlowEngine::start(
        store.clone(),
        demo_registry(),
        config(),
        services(Arc::new(InMemoryPersistenceService::new())),
    )
    .unwrap();

    let args = Payload::from_json(&PingArgs {
        counterparty: Party::from("bob"),
        rounds: 3,
    })
    .unwrap();
    let flow = engine.start_flow(PING_FLOW, Party::from("alice"), args).unwrap();

    let status = engine.wait_for_status(&flow, TIMEOUT).await;
    assert_eq!(
        status,
        Some(FlowStatus::Completed {
            result: Payload::from_json(&vec!["pong-1", "pong-2", "pong-3"]).unwrap()
        })
    );
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_runs_many_flows_in_parallel() {
    let store = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
    let persistence = Arc::new(InMemoryPersistenceService::new());
    let engine = FlowEngine::start(store.clone(), demo_registry(), config(), services(persistence.clone())).unwrap();

    let flows: Vec<FlowId> = (0..20)
        .map(|i| {
            engine
                .start_flow(SIGN_AND_STORE_FLOW, Party::from("alice"), Payload::from(format!("doc-{}", i)))
                .unwrap()
        })
        .collect();

    for flow in &flows {
        let status = engine.wait_for_status(flow, TIMEOUT).await;
        assert!(matches!(status, Some(FlowStatus::Completed { .. })), "{} ended as {:?}", flow, status);
    }
    assert_eq!(persistence.len(), flows.len());

    engine.shutdown().await;
    assert!(store.list_flows().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_reports_killed_flow() {
    let store = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
    // No persistence service: the flow waits on its store request forever.
    let engine = FlowEngine::start(
        store,
        demo_registry(),
        config(),
        vec![(ExternalCategory::Crypto, Arc::new(DemoSigningService::new("k")) as Arc<dyn ExternalService>)],
    )
    .unwrap();

    let flow = engine
        .start_flow(SIGN_AND_STORE_FLOW, Party::from("alice"), Payload::from("doc"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.bus().status_of(&flow), Some(FlowStatus::Running));

    engine.kill(&flow, "stuck").unwrap();
    assert_eq!(
        engine.wait_for_status(&flow, TIMEOUT).await,
        Some(FlowStatus::Killed { reason: "stuck".into() })
    );
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_recovers_flows_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flows.db");

    let flow = {
        let store = Arc::new(SqliteCheckpointStore::open(&path).unwrap());
        let engine = FlowEngine::start(
            store,
            demo_registry(),
            config(),
            vec![(ExternalCategory::Crypto, Arc::new(DemoSigningService::new("k")) as Arc<dyn ExternalService>)],
        )
        .unwrap();
        let flow = engine
            .start_flow(SIGN_AND_STORE_FLOW, Party::from("alice"), Payload::from("doc"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.shutdown().await;
        flow
    };

    let store = Arc::new(SqliteCheckpointStore::open(&path).unwrap());
    assert!(store.load(&flow).unwrap().is_some());
    let persistence = Arc::new(InMemoryPersistenceService::new());
    let engine = FlowEngine::start(store, demo_registry(), config(), services(persistence.clone())).unwrap();

    assert!(matches!(
        engine.wait_for_status(&flow, TIMEOUT).await,
        Some(FlowStatus::Completed { .. })
    ));
    assert!(persistence.get(flow.as_str()).is_some());
    engine.shutdown().await;
}

#[test]
fn test_partition_is_stable_per_flow() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let store = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let pipeline = Arc::new(flow_pipeline::FlowEventPipeline::new(store, demo_registry(), config()));
        let pool = FlowWorkerPool::start(pipeline, Arc::new(tokio::sync::Notify::new()));

        assert_eq!(pool.partitions(), 3);
        let flow = FlowId::from("some-flow");
        let partition = pool.partition_for(&flow);
        assert!(partition < 3);
        assert_eq!(pool.partition_for(&flow), partition);
        pool.shutdown().await;
    });
}
