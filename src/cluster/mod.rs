//! Node-to-node control.
//!
//! [`ClusterControl`] holds the operations one node may ask of another.
//! With the `cluster` feature, [`http`] exposes them over axum and
//! [`ClusterClient`] calls them on remote nodes.

pub mod auth;
pub mod control;
pub mod events;
pub mod reports;

#[cfg(feature = "cluster")]
pub mod client;
#[cfg(feature = "cluster")]
pub mod http;

use async_trait::async_trait;
use serde_json::Value;

pub use auth::{NodeAuthenticator, NodeCredential, NODE_AUTH_SCHEME};
#[cfg(feature = "cluster")]
pub use client::ClusterClient;
pub use control::{ClusterControl, SchedulerStatus};
pub use events::{CacheRegistry, ClusterEvent, EventDispatcher};
pub use reports::ReportDirectory;

use crate::domain::NodeRecord;
use crate::error::Result;
use crate::types::result::OperationResult;

/// Calls the control surface of another node.
#[async_trait]
pub trait RemoteNodeClient: Send + Sync {
    /// `GET /scheduler`.
    async fn scheduler_information(&self, node: &NodeRecord) -> Result<SchedulerStatus>;

    /// `POST /scheduler/stop`.
    async fn stop_scheduler(&self, node: &NodeRecord) -> Result<OperationResult>;

    /// `POST /scheduler/start`.
    async fn start_scheduler(&self, node: &NodeRecord) -> Result<OperationResult>;

    /// `POST /tasks/{id}/stop`.
    async fn stop_task(&self, node: &NodeRecord, task_id: &str) -> Result<OperationResult>;

    /// `POST /event/{type}`.
    async fn dispatch_event(
        &self,
        node: &NodeRecord,
        event_type: &str,
        payload: Value,
    ) -> Result<OperationResult>;

    /// `GET /reportFiles?filename=`.
    async fn fetch_report(&self, node: &NodeRecord, name: &str) -> Result<Vec<u8>>;

    /// `DELETE /reportFiles?filename=`.
    async fn delete_report(&self, node: &NodeRecord, name: &str) -> Result<OperationResult>;
}
