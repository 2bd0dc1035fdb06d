//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::models::deployment::{DeploymentStatus, HistoryEntry, RollbackInfo};
use crate::server::state::ServerState;
use crate::utils::version_info;

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "cutover".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub environment: String,
    pub current: Option<DeploymentStatus>,
    pub in_progress: Vec<DeploymentStatus>,
}

/// Status of the latest and any running deployment
pub async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let orchestrator = &state.orchestrator;
    Json(StatusResponse {
        environment: orchestrator.config().environment.clone(),
        current: orchestrator.get_status().await,
        in_progress: orchestrator.in_progress().await,
    })
}

/// `?limit=N` on list endpoints
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)
    }
}

/// History response
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub deployments: Vec<DeploymentStatus>,
    pub total: usize,
}

/// Finished deployments, newest first
pub async fn history_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let deployments = state.orchestrator.get_history(query.limit()).await;
    let total = deployments.len();
    Json(HistoryResponse { deployments, total })
}

/// Deployments and rollbacks interleaved, newest first
pub async fn audit_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<HistoryEntry>> {
    Json(state.orchestrator.audit_log(query.limit()).await)
}

/// Versions response
#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub versions: Vec<String>,
    pub current: Option<String>,
    pub rollback_target: Option<String>,
}

/// Retained versions, oldest first
pub async fn versions_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let versions = state.orchestrator.version_history().await;
    let current = versions.last().cloned();
    let rollback_target = versions.len().checked_sub(2).map(|i| versions[i].clone());
    Json(VersionsResponse {
        versions,
        current,
        rollback_target,
    })
}

/// Every rollback performed
pub async fn rollbacks_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<RollbackInfo>> {
    Json(state.orchestrator.rollback_history().await)
}
