//! HTTP surface.
//!
//! | route        | body / query                         | response                     |
//! |--------------|--------------------------------------|------------------------------|
//! | `GET /`      |                                      | `{ sandexec, tensor }`       |
//! | `POST /exec` | `{ source, responseKeys? }`          | `{ stdout?, data? }`         |
//! | `GET /exec`  | `?source=...&responseKeys=a,b`       | `{ stdout?, data? }`         |
//!
//! Faults answer with their own status code and `{ message, lineNumber? }`.
//! Execution is synchronous and CPU-bound, so it runs on Tokio's blocking pool.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use sandexec::{
    ExecutionRequest, Executor, FaultPayload, ResponseKeys, SandboxFault, TENSOR_VERSION,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

pub fn router(executor: Arc<Executor>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/exec", get(exec_query).post(exec_json))
        .layer(CorsLayer::permissive())
        .with_state(executor)
}

/// Binds `addr` and serves until Ctrl-C.
pub async fn serve(addr: SocketAddr, executor: Arc<Executor>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, mode = ?executor.settings().mode, "listening");
    axum::serve(listener, router(executor))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn index() -> Json<Value> {
    Json(json!({
        "sandexec": sandexec::VERSION,
        "tensor": TENSOR_VERSION,
    }))
}

#[derive(Debug, Deserialize)]
struct ExecQuery {
    #[serde(default)]
    source: String,
    #[serde(rename = "responseKeys", alias = "response_keys", alias = "return")]
    response_keys: Option<String>,
}

async fn exec_query(
    State(executor): State<Arc<Executor>>,
    Query(query): Query<ExecQuery>,
) -> Result<Response, ApiError> {
    let response_keys = query
        .response_keys
        .as_deref()
        .map(ResponseKeys::from_query)
        .unwrap_or_default();
    run(executor, ExecutionRequest::new(query.source, response_keys)).await
}

async fn exec_json(
    State(executor): State<Arc<Executor>>,
    body: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    run(executor, request).await
}

async fn run(executor: Arc<Executor>, request: ExecutionRequest) -> Result<Response, ApiError> {
    let response = tokio::task::spawn_blocking(move || executor.execute(&request))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;
    Ok(Json(response).into_response())
}

#[derive(Debug)]
enum ApiError {
    Fault(SandboxFault),
    BadRequest(String),
    Internal(String),
}

impl From<SandboxFault> for ApiError {
    fn from(fault: SandboxFault) -> Self {
        ApiError::Fault(fault)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            ApiError::Fault(fault) => (
                StatusCode::from_u16(fault.status_code).unwrap_or(StatusCode::BAD_REQUEST),
                fault.payload(),
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                FaultPayload {
                    message,
                    line_number: None,
                },
            ),
            ApiError::Internal(message) => {
                tracing::error!(%message, "execution task failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    FaultPayload {
                        message,
                        line_number: None,
                    },
                )
            }
        };
        (status, Json(payload)).into_response()
    }
}
