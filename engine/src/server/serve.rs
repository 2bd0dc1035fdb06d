//! HTTP server setup

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::settings::ServerSettings;
use crate::errors::DeployError;
use crate::server::handlers::{
    audit_handler, health_handler, history_handler, rollbacks_handler, status_handler,
    version_handler, versions_handler,
};
use crate::server::state::ServerState;

/// Read-only routes
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Deployments
        .route("/status", get(status_handler))
        .route("/history", get(history_handler))
        .route("/audit", get(audit_handler))
        .route("/versions", get(versions_handler))
        .route("/rollbacks", get(rollbacks_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the status server, returning the bound address
pub async fn serve(
    options: &ServerSettings,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, JoinHandle<Result<(), DeployError>>), DeployError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    let listener = TcpListener::bind(&addr).await?;
    let local = listener.local_addr()?;
    info!("Starting status server on {}", local);

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await?;
        Ok(())
    });

    Ok((local, handle))
}
