//! Subcommand implementations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use flow_checkpoint::{CheckpointStore, SqliteCheckpointStore};
use flow_pipeline::demo::{demo_registry, PingArgs, PING_FLOW, SIGN_AND_STORE_FLOW};
use flow_pipeline::{
    DemoSigningService, EngineConfig, ExternalService, FlowEngine, InMemoryPersistenceService,
};
use flow_types::{ExternalCategory, FlowId, FlowStatus, Party, Payload};
use tracing::info;

/// Key used by the demo signing service.
const DEMO_SIGNING_KEY: &str = "ledgerflow-demo-key";

/// How long a one-shot command waits for its flow to finish.
const FLOW_TIMEOUT: Duration = Duration::from_secs(30);

/// `~/.ledgerflow/engine.json`, or `engine.json` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ledgerflow").join("engine.json"))
        .unwrap_or_else(|| PathBuf::from("engine.json"))
}

fn demo_services() -> Vec<(ExternalCategory, Arc<dyn ExternalService>)> {
    vec![
        (
            ExternalCategory::Crypto,
            Arc::new(DemoSigningService::new(DEMO_SIGNING_KEY)) as Arc<dyn ExternalService>,
        ),
        (
            ExternalCategory::Persistence,
            Arc::new(InMemoryPersistenceService::new()) as Arc<dyn ExternalService>,
        ),
    ]
}

fn start_engine(config: EngineConfig) -> anyhow::Result<FlowEngine> {
    let store = SqliteCheckpointStore::open(&config.database_path)
        .with_context(|| format!("opening checkpoint store {}", config.database_path.display()))?;
    info!(database = %config.database_path.display(), partitions = config.partitions, "Starting flow engine");
    Ok(FlowEngine::start(Arc::new(store), demo_registry(), config, demo_services())?)
}

/// Runs until ctrl-c.
pub async fn serve(config: EngineConfig) -> anyhow::Result<()> {
    let engine = start_engine(config)?;
    info!("Flow engine running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested");
    engine.shutdown().await;
    Ok(())
}

pub async fn ping(config: EngineConfig, from: &str, to: &str, rounds: u32) -> anyhow::Result<()> {
    let args = Payload::from_json(&PingArgs {
        counterparty: Party::from(to),
        rounds,
    })?;
    run_once(config, PING_FLOW, Party::from(from), args).await
}

pub async fn sign(config: EngineConfig, identity: &str, document: String) -> anyhow::Result<()> {
    run_once(config, SIGN_AND_STORE_FLOW, Party::from(identity), Payload::from(document)).await
}

/// Starts one flow, prints its final status and stops the engine.
async fn run_once(config: EngineConfig, flow_name: &str, identity: Party, args: Payload) -> anyhow::Result<()> {
    let engine = start_engine(config)?;
    let flow_id = engine.start_flow(flow_name, identity, args)?;
    info!(flow_id = %flow_id, flow = flow_name, "Flow started");

    let status = tokio::select! {
        status = engine.wait_for_status(&flow_id, FLOW_TIMEOUT) => status,
        _ = tokio::signal::ctrl_c() => None,
    };
    engine.shutdown().await;

    match status {
        Some(status) => {
            print_status(&flow_id, &status)?;
            if !matches!(status, FlowStatus::Completed { .. }) {
                bail!("flow {} did not complete", flow_id);
            }
            Ok(())
        }
        None => bail!("flow {} still running; it resumes on the next start", flow_id),
    }
}

fn print_status(flow_id: &FlowId, status: &FlowStatus) -> anyhow::Result<()> {
    let rendered = match status {
        FlowStatus::Completed { result } => serde_json::json!({
            "flow_id": flow_id.as_str(),
            "state": "completed",
            "result": result.to_string_lossy(),
        }),
        other => {
            let mut value = serde_json::to_value(other)?;
            value["flow_id"] = serde_json::Value::String(flow_id.as_str().to_string());
            value
        }
    };
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

/// Prints one line per stored flow.
pub fn status(config: &EngineConfig) -> anyhow::Result<()> {
    let store = SqliteCheckpointStore::open(&config.database_path)
        .with_context(|| format!("opening checkpoint store {}", config.database_path.display()))?;
    let flows = store.list_flows()?;
    if flows.is_empty() {
        println!("No flows in {}", config.database_path.display());
        return Ok(());
    }

    for flow_id in flows {
        let Some(checkpoint) = store.load(&flow_id)? else {
            continue;
        };
        let waiting = match &checkpoint.suspension {
            Some(point) => serde_json::to_string(point)?,
            None => "starting".to_string(),
        };
        println!(
            "{}\t{}\t{}\tv{}\t{}",
            flow_id, checkpoint.flow_name, checkpoint.identity, checkpoint.version, waiting
        );
    }
    Ok(())
}
