//! HTTP API Server
//!
//! REST API for status queries, node administration and in-doubt recovery.

use std::sync::Arc;
use axum::{
    extract::{Path, State, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::commit::{recovery, CommitBarrier};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::state::{ClusterState, ClusterSummary, NodeId, NodeStatus};
use crate::txlog::DurableLog;

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: NodeId,
    /// Cluster state
    pub cluster: Arc<ClusterState>,
    /// Commit barrier shared with the coordinator
    pub barrier: CommitBarrier,
    /// Local transaction log
    pub log: Arc<dyn DurableLog>,
    /// When the node started
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(cluster: Arc<ClusterState>, barrier: CommitBarrier, log: Arc<dyn DurableLog>) -> Self {
        Self {
            node_id: cluster.node_id(),
            cluster,
            barrier,
            log,
            started_at: chrono::Utc::now(),
        }
    }
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/cluster/nodes", get(handle_nodes))
            // Node administration
            .route("/cluster/nodes/:node_id/disable", post(handle_disable))
            .route("/cluster/nodes/:node_id/enable", post(handle_enable))
            // Recovery
            .route("/admin/resolve", post(handle_resolve))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: NodeId,
    pub status: NodeStatus,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub cluster: ClusterSummary,
    pub in_doubt: usize,
    pub uptime_seconds: i64,
}

/// Node administration response
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeActionResponse {
    pub success: bool,
    pub node_id: NodeId,
    pub previous: NodeStatus,
    pub status: NodeStatus,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(e: Error) -> Response {
    let (status, code) = match &e {
        Error::NodeNotFound(_) => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
        Error::IllegalStatusChange { .. } => (StatusCode::CONFLICT, "ILLEGAL_STATUS_CHANGE"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let status = state.cluster.own_status().await;
    Json(HealthResponse {
        healthy: status == NodeStatus::Online,
        node_id: state.node_id,
        status,
    })
}

async fn handle_status(
    State(state): State<Arc<AppState>>,
) -> Response {
    let in_doubt = match state.log.in_doubt().await {
        Ok(records) => records.len(),
        Err(e) => return error_response(e),
    };

    Json(StatusResponse {
        node_id: state.node_id,
        status: state.cluster.own_status().await,
        cluster: state.cluster.summary().await,
        in_doubt,
        uptime_seconds: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
    .into_response()
}

async fn handle_nodes(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.cluster.all_nodes().await)
}

async fn handle_disable(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<NodeId>,
) -> Response {
    tracing::warn!("Disable of node {} requested over the API", node_id);
    match state.cluster.set_status(node_id, NodeStatus::Disabled).await {
        Ok(previous) => Json(NodeActionResponse {
            success: true,
            node_id,
            previous,
            status: NodeStatus::Disabled,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_enable(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<NodeId>,
) -> Response {
    match recovery::enable_node(&state.cluster, &state.barrier, node_id).await {
        Ok(previous) => Json(NodeActionResponse {
            success: true,
            node_id,
            previous,
            status: NodeStatus::Online,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_resolve(
    State(state): State<Arc<AppState>>,
) -> Response {
    match recovery::resolve_in_doubt(state.node_id, state.log.as_ref()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}
