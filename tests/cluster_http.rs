//! Cluster control surface over real HTTP.
//!
//! Two engines share one store. Node A serves its cluster router on an
//! ephemeral port and runs its scheduler; node B only talks to it through
//! the reqwest client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;

use taskweave::cluster::{CacheRegistry, ClusterClient, NodeAuthenticator, RemoteNodeClient};
use taskweave::handler::noop::{NoOpHandler, DELAY_KEY, NOOP_HANDLER_ID, STEPS_KEY};
use taskweave::store::generic::GenericTaskStore;
use taskweave::store::memory::InMemoryBackend;
use taskweave::{
    EngineConfig, EngineError, ExecutionStatus, ExtensionDelta, HandlerFrame, NodeRecord,
    OperationStatus, TaskEngine, TaskEngineBuilder, TaskRecord, TaskStore,
};

const SECRET: &str = "cluster-secret";

struct Cluster {
    store: Arc<dyn TaskStore>,
    node_a: TaskEngine,
    node_b: TaskEngine,
    base_url: String,
    reports: TempDir,
    invalidations: Arc<AtomicUsize>,
}

fn config(node_id: &str, url: Option<String>, reports: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.node.id = node_id.to_string();
    config.node.url = url;
    config.scheduler.scan_interval_ms = 20;
    config.cluster.secret = Some(SECRET.to_string());
    config.cluster.report_dir = reports.path().to_path_buf();
    config
}

impl Cluster {
    async fn start() -> Self {
        let store: Arc<dyn TaskStore> = Arc::new(GenericTaskStore::new(InMemoryBackend::new()));
        let reports = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let invalidations = Arc::new(AtomicUsize::new(0));
        let events = CacheRegistry::new();
        let counter = Arc::clone(&invalidations);
        events.register("handlerCache", move |_payload| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let node_a = TaskEngineBuilder::new(Arc::clone(&store))
            .with_config(config("node-a", Some(base_url.clone()), &reports))
            .with_handler(NOOP_HANDLER_ID, Arc::new(NoOpHandler::default()))
            .with_events(Arc::new(events))
            .build()
            .unwrap();
        node_a.start().await.unwrap();
        node_a.serve_cluster(listener);

        let mut config_b = config("node-b", None, &reports);
        config_b.scheduler.start_on_boot = false;
        let node_b = TaskEngineBuilder::new(Arc::clone(&store))
            .with_config(config_b)
            .build()
            .unwrap();

        Self {
            store,
            node_a,
            node_b,
            base_url,
            reports,
            invalidations,
        }
    }

    async fn node_a_record(&self) -> NodeRecord {
        self.store.get_node("node-a").await.unwrap()
    }

    fn client(&self) -> ClusterClient {
        ClusterClient::new("node-b", &self.node_b.config().cluster).unwrap()
    }

    fn raw(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        reqwest::Client::new().request(method, format!("{}{path}", self.base_url))
    }

    fn authorized(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.raw(method, path).header(
            reqwest::header::AUTHORIZATION,
            NodeAuthenticator::authorization_header("node-b", SECRET),
        )
    }

    async fn noop_task(&self, steps: u64, delay_ms: u64) -> TaskRecord {
        let extension = ExtensionDelta::new()
            .set(STEPS_KEY, json!(steps))
            .set(DELAY_KEY, json!(delay_ms));
        let record = TaskRecord::new(HandlerFrame::new(NOOP_HANDLER_ID)).with_extension(&extension);
        self.node_a.create_task(record).await.unwrap()
    }

    async fn wait_for_status(&self, task_id: &str, status: ExecutionStatus) -> TaskRecord {
        for _ in 0..500 {
            let record = self.store.get(task_id).await.unwrap();
            if record.execution_status == status {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status}");
    }

    async fn stop(self) {
        self.node_a.shutdown().await;
    }
}

// ─── Authentication ─────────────────────────────────────────────────────────

mod auth_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_credential_is_rejected_and_scheduler_keeps_running() {
        let cluster = Cluster::start().await;

        let response = cluster
            .raw(reqwest::Method::POST, "/scheduler/stop")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], json!("fatal_error"));

        let response = cluster
            .raw(reqwest::Method::POST, "/scheduler/stop")
            .header(
                reqwest::header::AUTHORIZATION,
                NodeAuthenticator::authorization_header("node-b", "wrong-secret"),
            )
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        assert!(cluster.node_a.scheduler().is_running());
        let task = cluster.noop_task(1, 1).await;
        cluster.wait_for_status(&task.task_id, ExecutionStatus::Closed).await;

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_route_requires_a_credential() {
        let cluster = Cluster::start().await;
        let routes = [
            (reqwest::Method::POST, "/event/handlerCache"),
            (reqwest::Method::GET, "/scheduler"),
            (reqwest::Method::POST, "/scheduler/start"),
            (reqwest::Method::POST, "/tasks/any/stop"),
            (reqwest::Method::GET, "/reportFiles?filename=report.txt"),
            (reqwest::Method::DELETE, "/reportFiles?filename=report.txt"),
        ];
        for (method, path) in routes {
            let status = cluster.raw(method.clone(), path).send().await.unwrap().status();
            assert_eq!(status, StatusCode::FORBIDDEN, "{method} {path}");
        }
        assert_eq!(cluster.invalidations.load(Ordering::SeqCst), 0);

        cluster.stop().await;
    }
}

// ─── Scheduler and tasks ────────────────────────────────────────────────────

mod scheduler_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduler_information_and_remote_stop_start() {
        let cluster = Cluster::start().await;
        let client = cluster.client();
        let node = cluster.node_a_record().await;

        let status = client.scheduler_information(&node).await.unwrap();
        assert_eq!(status.result.status, OperationStatus::Success);
        assert_eq!(status.information.node_id, "node-a");
        assert!(status.information.running);

        let body: serde_json::Value = cluster
            .authorized(reqwest::Method::GET, "/scheduler")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["result"]["status"], json!("success"));
        assert_eq!(body["information"]["nodeId"], json!("node-a"));

        let stopped = client.stop_scheduler(&node).await.unwrap();
        assert_eq!(stopped.status, OperationStatus::Success);
        assert!(!cluster.node_a.scheduler().is_running());

        let task = cluster.noop_task(1, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            cluster.store.get(&task.task_id).await.unwrap().execution_status,
            ExecutionStatus::Runnable
        );

        client.start_scheduler(&node).await.unwrap();
        assert!(cluster.node_a.scheduler().is_running());
        cluster.wait_for_status(&task.task_id, ExecutionStatus::Closed).await;

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_task_is_forwarded_to_owner() {
        let cluster = Cluster::start().await;
        let client = cluster.client();
        let node = cluster.node_a_record().await;

        let task = cluster.noop_task(10_000, 20).await;
        cluster.wait_for_status(&task.task_id, ExecutionStatus::Running).await;
        for _ in 0..500 {
            if cluster.node_a.executor().is_executing(&task.task_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        client.stop_scheduler(&node).await.unwrap();

        let result = cluster.node_b.stop_task(&task.task_id).await.unwrap();
        assert_eq!(result.status, OperationStatus::Success);
        assert_eq!(result.operation, "cluster.stopLocalTask");

        let released = cluster
            .wait_for_status(&task.task_id, ExecutionStatus::Runnable)
            .await;
        assert!(released.owner_node.is_none());

        let again = cluster.node_b.stop_task(&task.task_id).await.unwrap();
        assert_eq!(again.status, OperationStatus::PartialError);

        let direct = client.stop_task(&node, &task.task_id).await.unwrap();
        assert_eq!(direct.status, OperationStatus::PartialError);
        assert_eq!(direct.operation, "cluster.stopLocalTask");

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopping_unknown_task_is_not_found() {
        let cluster = Cluster::start().await;
        let response = cluster
            .authorized(reqwest::Method::POST, "/tasks/no-such-task/stop")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        cluster.stop().await;
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

mod event_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registered_event_invokes_callbacks() {
        let cluster = Cluster::start().await;
        let client = cluster.client();
        let node = cluster.node_a_record().await;

        let result = client
            .dispatch_event(&node, "handlerCache", json!({"handlerId": "x"}))
            .await
            .unwrap();
        assert_eq!(result.status, OperationStatus::Success);
        assert_eq!(cluster.invalidations.load(Ordering::SeqCst), 1);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_event_and_bad_payload_are_bad_requests() {
        let cluster = Cluster::start().await;

        let response = cluster
            .authorized(reqwest::Method::POST, "/event/nobodyListens")
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = cluster
            .authorized(reqwest::Method::POST, "/event/handlerCache")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(cluster.invalidations.load(Ordering::SeqCst), 0);

        cluster.stop().await;
    }
}

// ─── Report files ───────────────────────────────────────────────────────────

mod report_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_traversal_is_forbidden() {
        let cluster = Cluster::start().await;
        for (method, path) in [
            (reqwest::Method::POST, "/reportFiles?filename=../../etc/passwd"),
            (reqwest::Method::GET, "/reportFiles?filename=../../etc/passwd"),
            (reqwest::Method::GET, "/reportFiles?filename=%2Fetc%2Fpasswd"),
            (reqwest::Method::DELETE, "/reportFiles?filename=..%2Freport.txt"),
            (reqwest::Method::GET, "/reportFiles"),
        ] {
            let status = cluster.authorized(method.clone(), path).send().await.unwrap().status();
            assert_eq!(status, StatusCode::FORBIDDEN, "{method} {path}");
        }

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_report_is_not_found() {
        let cluster = Cluster::start().await;
        let client = cluster.client();
        let node = cluster.node_a_record().await;

        let response = cluster
            .authorized(reqwest::Method::GET, "/reportFiles?filename=absent.txt")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let err = client.fetch_report(&node, "absent.txt").await.unwrap_err();
        assert!(matches!(err, EngineError::Remote { .. }));

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_report_is_read_and_deleted() {
        let cluster = Cluster::start().await;
        let client = cluster.client();
        let node = cluster.node_a_record().await;
        let path = cluster.reports.path().join("stall-dump.txt");
        std::fs::write(&path, b"thread dump").unwrap();

        let bytes = client.fetch_report(&node, "stall-dump.txt").await.unwrap();
        assert_eq!(bytes, b"thread dump".to_vec());

        let response = cluster
            .authorized(reqwest::Method::POST, "/reportFiles?filename=stall-dump.txt")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let deleted = client.delete_report(&node, "stall-dump.txt").await.unwrap();
        assert_eq!(deleted.status, OperationStatus::Success);
        assert!(!path.exists());

        cluster.stop().await;
    }
}
