//! reqwest client for other nodes' cluster surfaces.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::auth::NodeAuthenticator;
use super::{RemoteNodeClient, SchedulerStatus};
use crate::config::ClusterConfig;
use crate::domain::NodeRecord;
use crate::error::{EngineError, Result};
use crate::types::result::OperationResult;

/// Calls other nodes with this node's credential.
#[derive(Clone)]
pub struct ClusterClient {
    http: reqwest::Client,
    authorization: String,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient").finish_non_exhaustive()
    }
}

fn remote(node_id: &str, message: impl Into<String>) -> EngineError {
    EngineError::Remote {
        node_id: node_id.to_string(),
        message: message.into(),
    }
}

impl ClusterClient {
    /// Creates a client authenticating as `node_id`.
    pub fn new(node_id: &str, config: &ClusterConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::Config(format!("cannot build cluster client: {e}")))?;
        Ok(Self {
            http,
            authorization: NodeAuthenticator::authorization_header(
                node_id,
                config.secret.as_deref().unwrap_or_default(),
            ),
        })
    }

    fn request(&self, node: &NodeRecord, method: Method, path: &str) -> Result<RequestBuilder> {
        self.request_with_query(node, method, path, &[])
    }

    fn request_with_query(
        &self,
        node: &NodeRecord,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<RequestBuilder> {
        let base = node
            .url
            .as_deref()
            .ok_or_else(|| remote(&node.node_id, "node has no cluster url"))?;
        let mut url = Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))
            .map_err(|e| remote(&node.node_id, format!("invalid node url: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(self
            .http
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, &self.authorization))
    }

    async fn send(&self, node: &NodeRecord, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| remote(&node.node_id, e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<OperationResult>().await {
            Ok(result) => result.message.unwrap_or_else(|| status.to_string()),
            Err(_) => status.to_string(),
        };
        tracing::warn!(node_id = %node.node_id, %status, message = %message, "cluster call failed");
        Err(match status {
            StatusCode::FORBIDDEN => EngineError::Unauthorized(message),
            _ => remote(&node.node_id, format!("{status}: {message}")),
        })
    }

    async fn json<T: DeserializeOwned>(
        &self,
        node: &NodeRecord,
        method: Method,
        path: &str,
    ) -> Result<T> {
        let request = self.request(node, method, path)?;
        self.send(node, request)
            .await?
            .json()
            .await
            .map_err(|e| remote(&node.node_id, format!("invalid response: {e}")))
    }
}

#[async_trait]
impl RemoteNodeClient for ClusterClient {
    async fn scheduler_information(&self, node: &NodeRecord) -> Result<SchedulerStatus> {
        self.json(node, Method::GET, "/scheduler").await
    }

    async fn stop_scheduler(&self, node: &NodeRecord) -> Result<OperationResult> {
        self.json(node, Method::POST, "/scheduler/stop").await
    }

    async fn start_scheduler(&self, node: &NodeRecord) -> Result<OperationResult> {
        self.json(node, Method::POST, "/scheduler/start").await
    }

    async fn stop_task(&self, node: &NodeRecord, task_id: &str) -> Result<OperationResult> {
        self.json(node, Method::POST, &format!("/tasks/{task_id}/stop"))
            .await
    }

    async fn dispatch_event(
        &self,
        node: &NodeRecord,
        event_type: &str,
        payload: Value,
    ) -> Result<OperationResult> {
        let request = self
            .request(node, Method::POST, &format!("/event/{event_type}"))?
            .json(&payload);
        self.send(node, request)
            .await?
            .json()
            .await
            .map_err(|e| remote(&node.node_id, format!("invalid response: {e}")))
    }

    async fn fetch_report(&self, node: &NodeRecord, name: &str) -> Result<Vec<u8>> {
        let request = self
            .request_with_query(node, Method::GET, "/reportFiles", &[("filename", name)])?;
        let bytes = self
            .send(node, request)
            .await?
            .bytes()
            .await
            .map_err(|e| remote(&node.node_id, e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn delete_report(&self, node: &NodeRecord, name: &str) -> Result<OperationResult> {
        let request = self
            .request_with_query(node, Method::DELETE, "/reportFiles", &[("filename", name)])?;
        self.send(node, request)
            .await?
            .json()
            .await
            .map_err(|e| remote(&node.node_id, format!("invalid response: {e}")))
    }
}
