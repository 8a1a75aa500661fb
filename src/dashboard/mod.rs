//! Read-only diagnostics endpoint.
//!
//! - `GET /api/status`: daemon state and per-group worker counts
//! - `GET /api/vms`: every known VM descriptor

use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::daemon::DaemonStatus;
use crate::vm::VmManager;

#[derive(Clone)]
pub struct DashboardState {
    pub status: watch::Receiver<DaemonStatus>,
    pub vms: VmManager,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/vms", get(vms_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state)).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    Json(status)
}

async fn vms_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.vms.all_vms().await {
        Ok(mut vms) => {
            vms.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
            (StatusCode::OK, Json(vms)).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot list VMs");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}
