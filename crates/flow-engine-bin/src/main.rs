//! Ledgerflow flow engine - runs checkpointed flows over a SQLite store.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flow_pipeline::EngineConfig;

/// Flow engine command-line interface.
#[derive(Parser, Debug)]
#[command(name = "flow-engine")]
#[command(about = "Durable flow engine with ordered sessions and an external-request outbox")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Engine configuration file (JSON). Missing files fall back to defaults.
    #[arg(long, env = "LEDGERFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// SQLite checkpoint database, overriding the configuration.
    #[arg(long, env = "LEDGERFLOW_DATABASE", global = true)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overriding the configuration.
    #[arg(short, long, env = "LEDGERFLOW_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Also append JSONL logs to ~/.ledgerflow/logs/engine.jsonl
    #[arg(long, global = true)]
    log_file: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine until interrupted, resuming stored flows
    Serve,
    /// Run a ping-pong session between two parties and print the result
    Ping {
        /// Party starting the session
        #[arg(long, default_value = "alice")]
        from: String,
        /// Party answering the pings
        #[arg(long, default_value = "bob")]
        to: String,
        /// Number of round trips
        #[arg(long, default_value_t = 3)]
        rounds: u32,
    },
    /// Sign a document and store the signature
    Sign {
        /// Document to sign
        document: String,
        /// Party running the flow
        #[arg(long, default_value = "alice")]
        identity: String,
    },
    /// List flows still held in the checkpoint store
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(app::default_config_path);
    let mut config = EngineConfig::load(&config_path)?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    observability::init_with_config(observability::LogConfig {
        service_name: "flow-engine".into(),
        default_level: config.log_level.clone(),
        json_file: cli.log_file,
        also_stderr: true,
        ..Default::default()
    });

    match cli.command {
        Some(Commands::Serve) | None => app::serve(config).await,
        Some(Commands::Ping { from, to, rounds }) => app::ping(config, &from, &to, rounds).await,
        Some(Commands::Sign { document, identity }) => app::sign(config, &identity, document).await,
        Some(Commands::Status) => app::status(&config),
    }
}
