//! Engine configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`taskweave.toml` by default)
//! 2. Environment variables (with `TASKWEAVE_` prefix)
//!
//! Environment variables override TOML configuration; anything left unset
//! keeps its default.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [node]
//! id = "node-a"
//! url = "http://10.0.0.5:8620"
//!
//! [scheduler]
//! worker_limit = 8
//! claim_timeout_ms = 300000
//!
//! [watcher]
//! stall_threshold_ms = 600000
//! repeat_notification_ms = 300000
//! skip_categories = ["async-update", "live-sync"]
//!
//! [cluster]
//! listen = "0.0.0.0:8620"
//! secret = "change-me"
//! report_dir = "/var/lib/taskweave/reports"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "taskweave.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TASKWEAVE_";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// This node.
    pub node: NodeConfig,
    /// Local scheduler.
    pub scheduler: SchedulerConfig,
    /// Stalled task watcher.
    pub watcher: WatcherConfig,
    /// Execution loop.
    pub execution: ExecutionConfig,
    /// Cluster control surface.
    pub cluster: ClusterConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Node identity and liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identifier, unique in the cluster.
    pub id: String,
    /// Base URL other nodes use to reach this node's cluster surface.
    pub url: Option<String>,
    /// How often the node writes its heartbeat.
    pub heartbeat_interval_ms: u64,
    /// A node whose heartbeat is older than this is considered dead.
    pub dead_after_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            url: None,
            heartbeat_interval_ms: 10_000,
            dead_after_ms: 60_000,
        }
    }
}

impl NodeConfig {
    /// Heartbeat period; never zero.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Liveness threshold.
    pub fn dead_after(&self) -> Duration {
        Duration::from_millis(self.dead_after_ms)
    }
}

/// Local scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether the scheduler claims tasks as soon as the engine starts.
    pub start_on_boot: bool,
    /// Maximum concurrently executing tasks on this node.
    pub worker_limit: usize,
    /// Claim scan period.
    pub scan_interval_ms: u64,
    /// A RUNNING task whose claim was not refreshed for this long is
    /// reclaimed.
    pub claim_timeout_ms: u64,
    /// Period of the orphaned-task reclaim sweep.
    pub reclaim_interval_ms: u64,
    /// Period of the waiting-task sweep.
    pub waiting_sweep_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            start_on_boot: true,
            worker_limit: 4,
            scan_interval_ms: 1_000,
            claim_timeout_ms: 300_000,
            reclaim_interval_ms: 30_000,
            waiting_sweep_interval_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    /// Claim scan period; never zero.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }

    /// Stale claim threshold.
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    /// Reclaim sweep period.
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    /// Waiting sweep period.
    pub fn waiting_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.waiting_sweep_interval_ms)
    }
}

/// Stalled task watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Whether the watcher runs at all.
    pub enabled: bool,
    /// Sweep period.
    pub interval_ms: u64,
    /// Progress unchanged for longer than this means stalled.
    pub stall_threshold_ms: u64,
    /// Minimum time between two notifications for the same task.
    pub repeat_notification_ms: u64,
    /// Categories exempt from stall detection.
    pub skip_categories: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            stall_threshold_ms: 600_000,
            repeat_notification_ms: 300_000,
            skip_categories: vec!["async-update".to_string()],
        }
    }
}

impl WatcherConfig {
    /// Sweep period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Stall threshold.
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    /// Repeat-notification interval.
    pub fn repeat_notification(&self) -> Duration {
        Duration::from_millis(self.repeat_notification_ms)
    }

    /// Returns `true` if `category` is exempt.
    pub fn skips(&self, category: &str) -> bool {
        self.skip_categories.iter().any(|c| c == category)
    }
}

/// Execution loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Temporary errors tolerated per frame before escalating to permanent.
    pub max_retries: u32,
    /// Delay before retrying a single-run frame after a temporary error.
    pub retry_delay_ms: u64,
    /// Claim keep-alive period while a handler invocation is in flight.
    pub claim_refresh_interval_ms: u64,
    /// Conflict retries for the loop's own writes.
    pub max_persist_retries: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5_000,
            claim_refresh_interval_ms: 30_000,
            max_persist_retries: 5,
        }
    }
}

impl ExecutionConfig {
    /// Temporary error back-off for single-run frames.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Claim keep-alive period; never zero.
    pub fn claim_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.claim_refresh_interval_ms.max(1))
    }
}

/// Cluster control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Socket address the HTTP surface listens on.
    pub listen: String,
    /// Shared node secret. Without one every node call is rejected.
    pub secret: Option<String>,
    /// Directory holding node-local report files.
    pub report_dir: PathBuf,
    /// Timeout for calls to other nodes.
    pub request_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8620".to_string(),
            secret: None,
            report_dir: PathBuf::from("reports"),
            request_timeout_ms: 10_000,
        }
    }
}

impl ClusterConfig {
    /// Remote call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Loads `taskweave.toml` from the working directory if present, then
    /// applies environment overrides and validates.
    pub fn load() -> Result<Self> {
        let mut config = match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(EngineError::Config(format!(
                    "failed to read {DEFAULT_CONFIG_FILE}: {e}"
                )))
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads a specific file, then applies environment overrides and
    /// validates.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::Config(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML without environment overrides or validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(format!("invalid TOML: {e}")))
    }

    /// Applies `TASKWEAVE_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup, keyed by full variable
    /// name. Unparseable values are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        fn parse<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(variable = name, value = %raw, "ignoring unparseable override");
                    None
                },
            }
        }

        if let Some(v) = get("NODE_ID") {
            self.node.id = v;
        }
        if let Some(v) = get("NODE_URL") {
            self.node.url = Some(v);
        }
        if let Some(v) = parse("NODE_HEARTBEAT_INTERVAL_MS", get("NODE_HEARTBEAT_INTERVAL_MS")) {
            self.node.heartbeat_interval_ms = v;
        }
        if let Some(v) = parse("NODE_DEAD_AFTER_MS", get("NODE_DEAD_AFTER_MS")) {
            self.node.dead_after_ms = v;
        }

        if let Some(v) = parse("SCHEDULER_START_ON_BOOT", get("SCHEDULER_START_ON_BOOT")) {
            self.scheduler.start_on_boot = v;
        }
        if let Some(v) = parse("SCHEDULER_WORKER_LIMIT", get("SCHEDULER_WORKER_LIMIT")) {
            self.scheduler.worker_limit = v;
        }
        if let Some(v) = parse("SCHEDULER_SCAN_INTERVAL_MS", get("SCHEDULER_SCAN_INTERVAL_MS")) {
            self.scheduler.scan_interval_ms = v;
        }
        if let Some(v) = parse("SCHEDULER_CLAIM_TIMEOUT_MS", get("SCHEDULER_CLAIM_TIMEOUT_MS")) {
            self.scheduler.claim_timeout_ms = v;
        }

        if let Some(v) = parse("WATCHER_ENABLED", get("WATCHER_ENABLED")) {
            self.watcher.enabled = v;
        }
        if let Some(v) = parse("WATCHER_INTERVAL_MS", get("WATCHER_INTERVAL_MS")) {
            self.watcher.interval_ms = v;
        }
        if let Some(v) = parse("WATCHER_STALL_THRESHOLD_MS", get("WATCHER_STALL_THRESHOLD_MS")) {
            self.watcher.stall_threshold_ms = v;
        }
        if let Some(v) = parse(
            "WATCHER_REPEAT_NOTIFICATION_MS",
            get("WATCHER_REPEAT_NOTIFICATION_MS"),
        ) {
            self.watcher.repeat_notification_ms = v;
        }
        if let Some(v) = get("WATCHER_SKIP_CATEGORIES") {
            self.watcher.skip_categories = v
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(v) = parse("EXECUTION_MAX_RETRIES", get("EXECUTION_MAX_RETRIES")) {
            self.execution.max_retries = v;
        }
        if let Some(v) = parse("EXECUTION_RETRY_DELAY_MS", get("EXECUTION_RETRY_DELAY_MS")) {
            self.execution.retry_delay_ms = v;
        }

        if let Some(v) = get("CLUSTER_LISTEN") {
            self.cluster.listen = v;
        }
        if let Some(v) = get("CLUSTER_SECRET") {
            self.cluster.secret = Some(v);
        }
        if let Some(v) = get("CLUSTER_REPORT_DIR") {
            self.cluster.report_dir = PathBuf::from(v);
        }

        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = parse("LOG_JSON", get("LOG_JSON")) {
            self.logging.json = v;
        }
    }

    /// Checks invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            return Err(EngineError::Config("node.id must not be empty".to_string()));
        }
        if self.node.id.contains(':') {
            return Err(EngineError::Config(
                "node.id must not contain ':'".to_string(),
            ));
        }
        if self.scheduler.worker_limit == 0 {
            return Err(EngineError::Config(
                "scheduler.worker_limit must be at least 1".to_string(),
            ));
        }
        if self.watcher.stall_threshold_ms == 0 {
            return Err(EngineError::Config(
                "watcher.stall_threshold_ms must be positive".to_string(),
            ));
        }
        if self.watcher.repeat_notification_ms == 0 {
            return Err(EngineError::Config(
                "watcher.repeat_notification_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.watcher.skip_categories, vec!["async-update".to_string()]);
        assert!(config.watcher.skips("async-update"));
        assert!(!config.watcher.skips("import"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [node]
            id = "node-a"

            [scheduler]
            worker_limit = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.node.id, "node-a");
        assert_eq!(config.scheduler.worker_limit, 8);
        assert_eq!(config.scheduler.scan_interval_ms, 1_000);
        assert_eq!(config.execution.max_retries, 3);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml("[node\nid=").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn overrides_take_priority() {
        let vars: HashMap<&str, &str> = [
            ("TASKWEAVE_NODE_ID", "node-b"),
            ("TASKWEAVE_SCHEDULER_WORKER_LIMIT", "2"),
            ("TASKWEAVE_WATCHER_SKIP_CATEGORIES", "async-update, live-sync ,"),
            ("TASKWEAVE_CLUSTER_SECRET", "s3cret"),
            ("TASKWEAVE_EXECUTION_MAX_RETRIES", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::from_toml("[node]\nid = \"node-a\"").unwrap();
        config.apply_overrides(|k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.node.id, "node-b");
        assert_eq!(config.scheduler.worker_limit, 2);
        assert_eq!(
            config.watcher.skip_categories,
            vec!["async-update".to_string(), "live-sync".to_string()]
        );
        assert_eq!(config.cluster.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.execution.max_retries, 3);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.scheduler.worker_limit = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.node.id = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.watcher.repeat_notification_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskweave.toml");
        std::fs::write(&path, "[watcher]\nstall_threshold_ms = 1234\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.watcher.stall_threshold_ms, 1234);
        assert!(EngineConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
