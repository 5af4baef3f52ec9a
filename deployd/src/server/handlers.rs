//! HTTP request handlers

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::DeployError;
use crate::models::{NewTask, TaskId};
use crate::secrets::DeployEnv;
use crate::server::state::ServerState;
use crate::telemetry::{RelayEvent, Subscription};
use crate::utils::version_info;

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps crate errors onto HTTP statuses
pub struct ApiError(DeployError);

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DeployError::ValidationError(_) | DeployError::IntegrityError(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::StateError(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal details stay in the logs
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployd".to_string(),
        version: version_info().version,
    })
}

/// Deployment intent as accepted over HTTP
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// Defaults to a fresh random id
    pub app_id: Option<String>,
    pub target_name: String,
    pub repo_url: String,
    pub branch: String,
    pub build_command: String,
    pub target_port: u16,
    /// Plain environment variables, encrypted before they are stored
    #[serde(default)]
    pub credentials: Option<DeployEnv>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub trace_id: TaskId,
    pub status: String,
}

/// Enqueue handler
pub async fn enqueue_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id = request
        .app_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let encrypted_credentials = match request.credentials {
        Some(env) if !env.is_empty() => Some(state.codec.encrypt_env(&env, &app_id)?),
        _ => None,
    };

    let trace_id = state
        .queue
        .enqueue(NewTask {
            app_id,
            target_name: request.target_name,
            repo_url: request.repo_url,
            branch: request.branch,
            build_command: request.build_command,
            target_port: request.target_port,
            encrypted_credentials,
        })
        .await?;

    info!("Queued deployment {}", trace_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            trace_id,
            status: "queued".to_string(),
        }),
    ))
}

/// Read-back handler
pub async fn get_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;
    Ok(Json(task))
}

/// Cancel handler; only pending deployments can be cancelled
pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.queue.cancel_pending(id).await? {
        return Err(DeployError::StateError(format!(
            "deployment {} is no longer pending",
            id
        ))
        .into());
    }

    let marker = "deployment cancelled\n";
    if let Err(e) = state.queue.append_log(id, marker).await {
        warn!("Failed to append log of {}: {}", id, e);
    }
    state.relay.broadcast(id, marker);
    state.relay.close(id);

    info!("Cancelled pending deployment {}", id);
    Ok(Json(EnqueueResponse {
        trace_id: id,
        status: "cancelled".to_string(),
    }))
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Live output as server-sent events: `chunk` events, then one `end` event
///
/// A deployment that already finished replays its persisted log instead.
pub async fn events_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    // Subscribe before reading the status so no chunk falls in between
    let subscription = state.relay.subscribe(id);
    let task = state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;

    let stream: EventStream = if task.status.is_terminal() {
        drop(subscription);
        replay(task.log)
    } else {
        live(subscription)
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn chunk_event(chunk: &str) -> Event {
    let data = chunk.replace('\r', "");
    let data = data.strip_suffix('\n').unwrap_or(&data);
    Event::default().event("chunk").data(data)
}

fn end_event() -> Event {
    Event::default().event("end").data("")
}

fn replay(log: String) -> EventStream {
    let events: Vec<Result<Event, Infallible>> = log
        .split_inclusive('\n')
        .map(|line| Ok(chunk_event(line)))
        .chain(std::iter::once(Ok(end_event())))
        .collect();
    Box::pin(futures::stream::iter(events))
}

fn live(subscription: Subscription) -> EventStream {
    Box::pin(futures::stream::unfold(
        Some(subscription),
        |subscription| async move {
            let mut subscription = subscription?;
            match subscription.recv().await {
                RelayEvent::Chunk(chunk) => Some((Ok(chunk_event(&chunk)), Some(subscription))),
                RelayEvent::End => Some((Ok(end_event()), None)),
            }
        },
    ))
}
