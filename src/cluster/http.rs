//! axum transport for [`ClusterControl`].
//!
//! | Method            | Path                          | Operation                    |
//! |-------------------|-------------------------------|------------------------------|
//! | `POST`            | `/event/{type}`               | dispatch a cluster event     |
//! | `GET`             | `/scheduler`                  | scheduler information        |
//! | `POST`            | `/scheduler/stop`             | stop claiming                |
//! | `POST`            | `/scheduler/start`            | start claiming               |
//! | `POST`            | `/tasks/{id}/stop`            | interrupt a local task       |
//! | `GET`, `POST`     | `/reportFiles?filename=`      | fetch a report file          |
//! | `DELETE`          | `/reportFiles?filename=`      | delete a report file         |
//!
//! Every route requires a node credential. Failures answer with the
//! error's status code and a FATAL [`OperationResult`] body.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::auth::NodeCredential;
use super::control::{ClusterControl, SchedulerStatus};
use crate::error::{EngineError, Result};
use crate::types::result::OperationResult;

/// Error response of the cluster surface.
#[derive(Debug)]
pub struct ApiError {
    operation: &'static str,
    error: EngineError,
}

impl ApiError {
    fn new(operation: &'static str, error: EngineError) -> Self {
        Self { operation, error }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = OperationResult::fatal(self.operation, self.error.to_string());
        (self.error.status_code(), Json(body)).into_response()
    }
}

/// Extracts and verifies the caller's node credential.
#[derive(Debug, Clone)]
pub struct NodeAuth(pub NodeCredential);

impl FromRequestParts<Arc<ClusterControl>> for NodeAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        control: &Arc<ClusterControl>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        control
            .authenticate(header)
            .map(NodeAuth)
            .map_err(|e| ApiError::new("cluster.authenticate", e))
    }
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    filename: Option<String>,
}

/// Builds the cluster router.
pub fn router(control: Arc<ClusterControl>) -> Router {
    Router::new()
        .route("/event/{event_type}", post(dispatch_event))
        .route("/scheduler", get(scheduler_information))
        .route("/scheduler/stop", post(stop_scheduler))
        .route("/scheduler/start", post(start_scheduler))
        .route("/tasks/{task_id}/stop", post(stop_task))
        .route(
            "/reportFiles",
            get(read_report).post(read_report).delete(delete_report),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(control)
}

/// Serves the cluster surface on `listener` until `shutdown` fires.
pub async fn serve(
    control: Arc<ClusterControl>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(node_id = %control.node_id(), %addr, "cluster control listening");
    }
    axum::serve(listener, router(control))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn dispatch_event(
    NodeAuth(caller): NodeAuth,
    State(control): State<Arc<ClusterControl>>,
    Path(event_type): Path<String>,
    body: Bytes,
) -> std::result::Result<Json<OperationResult>, ApiError> {
    const OP: &str = "cluster.event";
    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError::new(OP, EngineError::InvalidRequest(format!("event payload: {e}")))
        })?
    };
    control
        .dispatch_event(&caller, &event_type, payload)
        .await
        .map(Json)
        .map_err(|e| ApiError::new(OP, e))
}

async fn scheduler_information(
    NodeAuth(caller): NodeAuth,
    State(control): State<Arc<ClusterControl>>,
) -> Json<SchedulerStatus> {
    Json(control.scheduler_information(&caller))
}

async fn stop_scheduler(
    NodeAuth(caller): NodeAuth,
    State(control): State<Arc<ClusterControl>>,
) -> Json<OperationResult> {
    Json(control.stop_scheduler(&caller))
}

async fn start_scheduler(
    NodeAuth(caller): NodeAuth,
    State(control): State<Arc<ClusterControl>>,
) -> Json<OperationResult> {
    Json(control.start_scheduler(&caller))
}

async fn stop_task(
    NodeAuth(caller): NodeAuth,
    State(control): State<Arc<ClusterControl>>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<OperationResult>, ApiError> {
    control
        .stop_task(&caller, &task_id)
        .await
        .map(Json)
        .map_err(|e| ApiError::new("cluster.stopLocalTask", e))
}

async fn read_report(
    NodeAuth(caller): NodeAuth,
    State(control): State<Arc<ClusterControl>>,
    Query(query): Query<ReportQuery>,
) -> std::result::Result<Response, ApiError> {
    let name = query.filename.unwrap_or_default();
    let bytes = control
        .read_report(&caller, &name)
        .await
        .map_err(|e| ApiError::new("cluster.getReportFile", e))?;
    Ok(([(CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

async fn delete_report(
    NodeAuth(caller): NodeAuth,
    State(control): State<Arc<ClusterControl>>,
    Query(query): Query<ReportQuery>,
) -> std::result::Result<Json<OperationResult>, ApiError> {
    let name = query.filename.unwrap_or_default();
    control
        .delete_report(&caller, &name)
        .await
        .map(Json)
        .map_err(|e| ApiError::new("cluster.deleteReportFile", e))
}
