//! Agent HTTP server
//!
//! Exposes the execution endpoint. Bind it to loopback or an internal
//! interface only: whoever can reach it can run build commands.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::executor::Executor;
use crate::app::options::ServerOptions;
use crate::errors::DeployError;
use crate::protocol::client::EXECUTIONS_PATH;
use crate::protocol::local::start_execution;
use crate::protocol::ExecutionRequest;
use crate::utils::version_info;

/// Agent server state
pub struct AgentState {
    pub executor: Arc<Executor>,
}

impl AgentState {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: String,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "deployd-agent",
        version: version_info().version,
    })
}

/// Stream one execution back as NDJSON frames
///
/// The execution is cancelled as soon as the response body is dropped,
/// which is what happens when the orchestrator disconnects.
async fn execute_handler(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<ExecutionRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        warn!("Rejected execution {}: {}", request.trace_id, e);
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let (rx, guard) = start_execution(state.executor.clone(), request);
    let body = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let frame = rx.recv().await?;
        let line = serde_json::to_vec(&frame).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        });
        Some((line.map_err(std::io::Error::from), (rx, guard)))
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response()
}

/// Agent routes, without a listener
pub fn agent_router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(EXECUTIONS_PATH, post(execute_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the agent HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<AgentState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DeployError>>, DeployError> {
    let app = agent_router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting agent server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DeployError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DeployError::ServerError(e.to_string()))
    });

    Ok(handle)
}
