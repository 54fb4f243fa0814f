//! REST API for dynamic PID registration.
//!
//! Bound to loopback only; there is no authentication, so the bind address is
//! the security boundary.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::registry::{PidRegistry, RegistryError, TrackedProcess};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub pid: u32,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub pid: u32,
    pub threads: usize,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub thread_count: usize,
    pub registered_at: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub processes: Vec<ProcessInfo>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl From<&TrackedProcess> for ProcessInfo {
    fn from(proc: &TrackedProcess) -> Self {
        Self {
            pid: proc.parent_pid,
            thread_count: proc.thread_ids.len(),
            registered_at: proc.registered_at.to_rfc3339(),
        }
    }
}

pub fn router(registry: Arc<PidRegistry>) -> Router {
    Router::new()
        .route("/pids", get(list_pids).post(register_pid))
        .route("/pids/{pid}", get(get_pid).delete(unregister_pid))
        .with_state(registry)
}

/// Serve the API on `127.0.0.1:<port>` until cancelled.
pub async fn serve(registry: Arc<PidRegistry>, port: u16, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    info!(%addr, "REST API server starting");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind REST API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!(error = %e, "REST API server error");
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn status_for(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::NotRegistered(_) => StatusCode::NOT_FOUND,
        RegistryError::KernelMap { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        RegistryError::AlreadyRegistered(_) | RegistryError::ProcessNotFound { .. } => {
            StatusCode::BAD_REQUEST
        }
    }
}

async fn list_pids(State(registry): State<Arc<PidRegistry>>) -> Response {
    let procs = registry.list();
    let response = ListResponse {
        total: procs.len(),
        processes: procs.iter().map(ProcessInfo::from).collect(),
    };
    (StatusCode::OK, Json(response)).into_response()
}

async fn register_pid(
    State(registry): State<Arc<PidRegistry>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON payload");
    };
    if req.pid == 0 {
        return error_response(StatusCode::BAD_REQUEST, "PID is required and must be non-zero");
    }

    match registry.register(req.pid) {
        Ok(threads) => (
            StatusCode::CREATED,
            Json(RegisterResponse {
                pid: req.pid,
                threads,
                message: format!("registered PID {} with {} threads", req.pid, threads),
            }),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}

async fn get_pid(
    State(registry): State<Arc<PidRegistry>>,
    Path(pid): Path<u32>,
) -> Response {
    match registry.get(pid) {
        Some(proc) => (StatusCode::OK, Json(ProcessInfo::from(&proc))).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            RegistryError::NotRegistered(pid).to_string(),
        ),
    }
}

async fn unregister_pid(
    State(registry): State<Arc<PidRegistry>>,
    Path(pid): Path<u32>,
) -> Response {
    match registry.unregister(pid) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "message": format!("unregistered PID {pid}")
            })),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}
