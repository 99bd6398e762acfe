//! Runs one taskweave cluster node.
//!
//! Loads configuration, installs logging, starts the engine and the cluster
//! control listener, and shuts down gracefully on Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use taskweave::handler::noop::{NoOpHandler, DELAY_KEY, NOOP_HANDLER_ID, STEPS_KEY};
use taskweave::store::generic::GenericTaskStore;
use taskweave::store::memory::InMemoryBackend;
use taskweave::{EngineConfig, ExtensionDelta, HandlerFrame, TaskEngineBuilder, TaskRecord};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "taskweave-node")]
#[command(about = "Run a taskweave cluster node", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./taskweave.toml when present)
    #[arg(long, short, env = "TASKWEAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the cluster control listen address
    #[arg(long)]
    listen: Option<String>,

    /// Create this many demo tasks running the no-op handler
    #[arg(long, default_value_t = 0)]
    demo_tasks: usize,

    /// Steps per demo task
    #[arg(long, default_value_t = 20)]
    demo_steps: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path),
        None => EngineConfig::load(),
    }
    .context("loading configuration")?;
    if let Some(listen) = cli.listen {
        config.cluster.listen = listen;
    }

    taskweave::logging::init_logging(&config.logging).context("initialising logging")?;

    // The in-memory store only coordinates nodes inside this process.
    let store = Arc::new(GenericTaskStore::new(InMemoryBackend::new()));
    let listen = config.cluster.listen.clone();
    let engine = TaskEngineBuilder::new(store)
        .with_config(config)
        .with_handler(NOOP_HANDLER_ID, Arc::new(NoOpHandler::default()))
        .build()
        .context("building engine")?;

    engine.start().await.context("starting engine")?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding cluster listener on {listen}"))?;
    engine.serve_cluster(listener);

    for _ in 0..cli.demo_tasks {
        let extension = ExtensionDelta::new()
            .set(STEPS_KEY, cli.demo_steps.into())
            .set(DELAY_KEY, 500u64.into());
        let task = engine
            .create_task(
                TaskRecord::new(HandlerFrame::new(NOOP_HANDLER_ID))
                    .with_name("demo")
                    .with_extension(&extension),
            )
            .await?;
        tracing::info!(task_id = %task.task_id, "demo task created");
    }

    tracing::info!(node_id = %engine.node_id(), "node running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;

    tokio::time::timeout(Duration::from_secs(30), engine.shutdown())
        .await
        .context("engine did not stop within 30s")?;
    Ok(())
}
