use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    error::ScanError,
    probe::PortProber,
    registry::MemoryRegistry,
    scanner::{self, ScanRequest},
};

#[derive(Clone)]
pub struct AppState {
    pub prober: Arc<dyn PortProber>,
    pub registry: Arc<MemoryRegistry>,
}

impl IntoResponse for ScanError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/ip-addresses/scan-ports", get(scan_ports))
        .route("/hosts", get(list_hosts))
        .with_state(state);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn serve(
    bind: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving API");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn scan_ports(
    State(app): State<AppState>,
    Query(req): Query<ScanRequest>,
) -> Result<impl IntoResponse, ScanError> {
    let report = scanner::scan_ports(app.prober.clone(), &req)
        .await
        .inspect_err(|e| warn!(ip = %req.ip, error = %e, "scan request rejected"))?;
    Ok((StatusCode::OK, Json(report)))
}

async fn list_hosts(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.registry.snapshot().await))
}
