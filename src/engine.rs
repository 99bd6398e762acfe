//! Engine facade.
//!
//! [`TaskEngine`] wires one node together: the task store, the handler
//! registry, the execution loop, the local scheduler, the stalled task
//! watcher and the cluster control surface. Everything is constructed once
//! here and handed down explicitly.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskweave::handler::noop::{NoOpHandler, NOOP_HANDLER_ID};
//! use taskweave::store::{generic::GenericTaskStore, memory::InMemoryBackend};
//! use taskweave::{EngineConfig, HandlerFrame, TaskEngineBuilder, TaskRecord};
//!
//! # async fn example() -> taskweave::Result<()> {
//! let store = Arc::new(GenericTaskStore::new(InMemoryBackend::new()));
//! let engine = TaskEngineBuilder::new(store)
//!     .with_config(EngineConfig::default())
//!     .with_handler(NOOP_HANDLER_ID, Arc::new(NoOpHandler::default()))
//!     .build()?;
//! engine.start().await?;
//!
//! let task = engine
//!     .create_task(TaskRecord::new(HandlerFrame::new(NOOP_HANDLER_ID)))
//!     .await?;
//! println!("created {}", task.task_id);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cluster::{
    CacheRegistry, ClusterControl, EventDispatcher, NodeAuthenticator, RemoteNodeClient,
    ReportDirectory,
};
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticRecorder, StoreDiagnosticRecorder};
use crate::domain::TaskRecord;
use crate::error::{EngineError, Result};
use crate::execution::ExecutionLoop;
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::scheduler::LocalScheduler;
use crate::store::TaskStore;
use crate::types::result::OperationResult;
use crate::types::task::ExecutionStatus;
use crate::watcher::StalledTaskWatcher;

/// Assembles a [`TaskEngine`].
pub struct TaskEngineBuilder {
    store: Arc<dyn TaskStore>,
    config: EngineConfig,
    registry: Arc<HandlerRegistry>,
    events: Option<Arc<dyn EventDispatcher>>,
    recorder: Option<Arc<dyn DiagnosticRecorder>>,
    remote: Option<Arc<dyn RemoteNodeClient>>,
}

impl std::fmt::Debug for TaskEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngineBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl TaskEngineBuilder {
    /// Starts a builder over `store` with default configuration.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            registry: Arc::new(HandlerRegistry::new()),
            events: None,
            recorder: None,
            remote: None,
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an existing handler registry.
    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Registers one handler.
    pub fn with_handler(
        self,
        handler_id: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        self.registry.register(handler_id, handler);
        self
    }

    /// Uses a custom cluster event dispatcher. Defaults to an empty
    /// [`CacheRegistry`].
    pub fn with_events(mut self, events: Arc<dyn EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Uses a custom diagnostic recorder. Defaults to
    /// [`StoreDiagnosticRecorder`].
    pub fn with_recorder(mut self, recorder: Arc<dyn DiagnosticRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Uses a custom client for remote nodes.
    pub fn with_remote_client(mut self, remote: Arc<dyn RemoteNodeClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> Result<TaskEngine> {
        self.config.validate()?;
        let config = self.config;
        let node_id = config.node.id.clone();

        let executor = Arc::new(ExecutionLoop::new(
            node_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            config.execution.clone(),
        ));
        let scheduler = Arc::new(LocalScheduler::new(
            config.node.clone(),
            config.scheduler.clone(),
            Arc::clone(&self.store),
            Arc::clone(&executor),
        ));
        let recorder = self.recorder.unwrap_or_else(|| {
            Arc::new(StoreDiagnosticRecorder::new(Arc::clone(&self.store), node_id.clone()))
        });
        let watcher = Arc::new(StalledTaskWatcher::new(
            config.watcher.clone(),
            Arc::clone(&executor),
            Arc::clone(&self.store),
            recorder,
        ));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(CacheRegistry::new()));
        let control = Arc::new(ClusterControl::new(
            Arc::clone(&self.store),
            Arc::clone(&scheduler),
            Arc::clone(&executor),
            events,
            ReportDirectory::new(config.cluster.report_dir.clone()),
            NodeAuthenticator::new(config.cluster.secret.as_deref()),
        ));
        let remote = match self.remote {
            Some(remote) => Some(remote),
            None => default_remote(&node_id, &config)?,
        };

        Ok(TaskEngine {
            config,
            store: self.store,
            registry: self.registry,
            executor,
            scheduler,
            watcher,
            control,
            remote,
            shutdown: CancellationToken::new(),
            background: Mutex::new(JoinSet::new()),
        })
    }
}

#[cfg(feature = "cluster")]
fn default_remote(
    node_id: &str,
    config: &EngineConfig,
) -> Result<Option<Arc<dyn RemoteNodeClient>>> {
    if config.cluster.secret.is_none() {
        return Ok(None);
    }
    let client = crate::cluster::ClusterClient::new(node_id, &config.cluster)?;
    Ok(Some(Arc::new(client)))
}

#[cfg(not(feature = "cluster"))]
fn default_remote(
    _node_id: &str,
    _config: &EngineConfig,
) -> Result<Option<Arc<dyn RemoteNodeClient>>> {
    Ok(None)
}

/// One running cluster node.
pub struct TaskEngine {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    executor: Arc<ExecutionLoop>,
    scheduler: Arc<LocalScheduler>,
    watcher: Arc<StalledTaskWatcher>,
    control: Arc<ClusterControl>,
    remote: Option<Arc<dyn RemoteNodeClient>>,
    shutdown: CancellationToken,
    background: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("node_id", &self.config.node.id)
            .field("scheduler", &self.scheduler)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl TaskEngine {
    /// This node's identifier.
    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    /// Effective configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared task store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Handler registry.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Execution loop and running-task table.
    pub fn executor(&self) -> &Arc<ExecutionLoop> {
        &self.executor
    }

    /// Local scheduler.
    pub fn scheduler(&self) -> &Arc<LocalScheduler> {
        &self.scheduler
    }

    /// Stalled task watcher.
    pub fn watcher(&self) -> &Arc<StalledTaskWatcher> {
        &self.watcher
    }

    /// Operations other nodes may call.
    pub fn cluster_control(&self) -> Arc<ClusterControl> {
        Arc::clone(&self.control)
    }

    /// Cluster HTTP router for this node.
    #[cfg(feature = "cluster")]
    pub fn router(&self) -> axum::Router {
        crate::cluster::http::router(self.cluster_control())
    }

    // ---- Lifecycle ----

    /// Recovers tasks left over from a previous run and starts the
    /// background loops.
    pub async fn start(&self) -> Result<()> {
        let recovered = self.scheduler.recover_own_tasks().await?;
        if recovered > 0 {
            tracing::warn!(
                node_id = %self.node_id(),
                recovered,
                "released tasks left running by a previous run"
            );
        }
        if self.config.scheduler.start_on_boot {
            self.scheduler.start();
        }
        self.scheduler.heartbeat().await?;

        let mut background = self.background.lock();
        background.spawn(Arc::clone(&self.scheduler).run(self.shutdown.child_token()));
        if self.config.watcher.enabled {
            background.spawn(Arc::clone(&self.watcher).run(self.shutdown.child_token()));
        }
        tracing::info!(
            node_id = %self.node_id(),
            worker_limit = self.config.scheduler.worker_limit,
            scheduler_running = self.scheduler.is_running(),
            "engine started"
        );
        Ok(())
    }

    /// Serves the cluster control surface on `listener` until shutdown.
    #[cfg(feature = "cluster")]
    pub fn serve_cluster(&self, listener: tokio::net::TcpListener) {
        let control = self.cluster_control();
        let shutdown = self.shutdown.child_token();
        self.background.lock().spawn(async move {
            if let Err(e) = crate::cluster::http::serve(control, listener, shutdown).await {
                tracing::error!(error = %e, "cluster control server failed");
            }
        });
    }

    /// Stops claiming, interrupts local tasks and waits for everything to
    /// wind down. Interrupted tasks return to RUNNABLE for other nodes.
    pub async fn shutdown(&self) {
        tracing::info!(node_id = %self.node_id(), "engine shutting down");
        self.scheduler.stop();
        self.executor.interrupt_all();
        self.shutdown.cancel();

        let mut background = std::mem::take(&mut *self.background.lock());
        while let Some(joined) = background.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "background loop aborted");
            }
        }
        self.scheduler.drain().await;

        if let Err(e) = self.scheduler.heartbeat().await {
            tracing::warn!(node_id = %self.node_id(), error = %e, "final heartbeat failed");
        }
        tracing::info!(node_id = %self.node_id(), "engine stopped");
    }

    // ---- Tasks ----

    /// Persists a new RUNNABLE task.
    pub async fn create_task(&self, record: TaskRecord) -> Result<TaskRecord> {
        let created = self.store.create(record).await?;
        tracing::info!(
            task_id = %created.task_id,
            handler_id = created.top_frame().map(|f| f.handler_id.as_str()).unwrap_or_default(),
            category = %created.category,
            "task created"
        );
        Ok(created)
    }

    /// Reads a task.
    pub async fn get_task(&self, task_id: &str) -> Result<TaskRecord> {
        self.store.get(task_id).await
    }

    /// Interrupts a task wherever it runs.
    ///
    /// A task executing here is interrupted directly; a task owned by
    /// another node is stopped through that node's cluster surface. A task
    /// that is not running gets a partial result.
    pub async fn stop_task(&self, task_id: &str) -> Result<OperationResult> {
        if self.executor.interrupt(task_id) {
            return Ok(OperationResult::success("engine.stopTask"));
        }

        let record = self.store.get(task_id).await?;
        let owner = match (record.execution_status, record.owner_node) {
            (ExecutionStatus::Running, Some(owner)) if owner != self.config.node.id => owner,
            _ => {
                return Ok(OperationResult::partial(
                    "engine.stopTask",
                    format!("task {task_id} is not running"),
                ))
            },
        };

        let remote = self.remote.as_ref().ok_or_else(|| EngineError::Remote {
            node_id: owner.clone(),
            message: "no cluster client configured".to_string(),
        })?;
        let node = self.store.get_node(&owner).await?;
        tracing::info!(task_id, owner = %owner, "forwarding task stop to owner node");
        remote.stop_task(&node, task_id).await
    }

    /// Since when a task has been stalled, as observed by this node.
    pub async fn stalled_since(&self, task_id: &str) -> Result<Option<DateTime<Utc>>> {
        let record = self.store.get(task_id).await?;
        Ok(self.watcher.stalled_since(&record, Utc::now()))
    }
}
