//! Operator HTTP API.

use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use fleet_core::{
    ActionId, AgentId, DispatchError, Job, JobId, JobStatus, RequestPayload, SessionId,
    message::SetStateRequest, traits::JobFilter,
};
use fleet_services::{ActionError, ActionResultView, ActionSpec, JobError, JobSpec};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::app::Controller;

type AppState = State<Arc<Controller>>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("agent {0} has no session here")]
    NoSession(AgentId),
    #[error("encoding metrics failed: {0}")]
    Metrics(String),
}

const fn dispatch_status(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::NotConnected(_) => StatusCode::NOT_FOUND,
        DispatchError::ConnectionError(_) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::Backpressure => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::Rejected(_) | DispatchError::Forwarding(_) | DispatchError::ForwardingLoop => {
            StatusCode::BAD_GATEWAY
        }
    }
}

impl ApiError {
    const fn status_code(&self) -> StatusCode {
        match self {
            Self::Dispatch(err)
            | Self::Action(ActionError::Dispatch(err))
            | Self::Job(JobError::Dispatch(err)) => dispatch_status(err),
            Self::Action(ActionError::NotFound(_))
            | Self::Job(JobError::NotFound(_))
            | Self::NoSession(_) => StatusCode::NOT_FOUND,
            // Poll again later.
            Self::Action(ActionError::NotYetAvailable(_)) => StatusCode::ACCEPTED,
            Self::Job(JobError::Storage(_)) | Self::Metrics(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct AgentView {
    agent_id: AgentId,
    session_id: SessionId,
    status: String,
    version: String,
    messages_sent: u64,
    messages_received: u64,
    pending_requests: usize,
    outbound_queued: usize,
}

async fn list_agents(State(controller): AppState) -> Json<Vec<AgentView>> {
    let views = controller
        .registry
        .connected_agents()
        .into_iter()
        .filter_map(|agent_id| controller.registry.lookup(&agent_id))
        .map(|session| {
            let metrics = session.metrics();
            AgentView {
                agent_id: session.agent_id().clone(),
                session_id: session.id(),
                status: format!("{:?}", session.status()).to_lowercase(),
                version: session.identity().version.clone(),
                messages_sent: metrics.sent,
                messages_received: metrics.received,
                pending_requests: metrics.pending,
                outbound_queued: metrics.queued,
            }
        })
        .collect();
    Json(views)
}

/// Round trip through whichever replica owns the agent.
async fn ping_agent(
    State(controller): AppState,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent_id = AgentId::new(agent_id);
    let started = Instant::now();
    controller
        .forwarding
        .route(&agent_id, RequestPayload::Ping, controller.config.dispatch.default_timeout())
        .await?;
    let rtt_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    Ok(Json(json!({ "agent_id": agent_id, "rtt_ms": rtt_ms })))
}

async fn put_desired_state(
    State(controller): AppState,
    Path(agent_id): Path<String>,
    Json(state): Json<SetStateRequest>,
) -> StatusCode {
    let agent_id = AgentId::new(agent_id);
    controller.inventory.set(agent_id.clone(), state);
    controller.reconciler.request_push(&agent_id);
    StatusCode::ACCEPTED
}

async fn reconcile_all(State(controller): AppState) -> StatusCode {
    controller.reconciler.update_all();
    StatusCode::ACCEPTED
}

async fn kick_agent(
    State(controller): AppState,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let agent_id = AgentId::new(agent_id);
    if controller.registry.kick(&agent_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NoSession(agent_id))
    }
}

/// Remove an agent from inventory, closing its session and dropping its metrics.
async fn remove_agent(State(controller): AppState, Path(agent_id): Path<String>) -> StatusCode {
    let agent_id = AgentId::new(agent_id);
    controller.inventory.remove(&agent_id);
    controller.registry.kick(&agent_id);
    controller.registry.forget(&agent_id);
    StatusCode::NO_CONTENT
}

async fn start_action(
    State(controller): AppState,
    Path(agent_id): Path<String>,
    Json(spec): Json<ActionSpec>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let action_id = controller
        .actions
        .start(&AgentId::new(agent_id), spec)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "action_id": action_id }))))
}

async fn get_action(
    State(controller): AppState,
    Path(action_id): Path<ActionId>,
) -> Result<Json<ActionResultView>, ApiError> {
    Ok(Json(controller.actions.get_result(action_id)?))
}

async fn stop_action(
    State(controller): AppState,
    Path((agent_id, action_id)): Path<(String, ActionId)>,
) -> Result<StatusCode, ApiError> {
    controller
        .actions
        .stop(&AgentId::new(agent_id), action_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_job(
    State(controller): AppState,
    Path(agent_id): Path<String>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let job_id = controller.jobs.submit(&AgentId::new(agent_id), spec).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

#[derive(Debug, Default, Deserialize)]
struct JobQuery {
    agent_id: Option<String>,
    status: Option<JobStatus>,
    limit: Option<usize>,
}

async fn list_jobs(
    State(controller): AppState,
    Query(query): Query<JobQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let filter = JobFilter {
        agent_id: query.agent_id.map(AgentId::new),
        status: query.status,
        limit: query.limit,
    };
    Ok(Json(controller.jobs.list(filter).await?))
}

async fn get_job(
    State(controller): AppState,
    Path(job_id): Path<JobId>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(controller.jobs.get(job_id).await?))
}

async fn cancel_job(
    State(controller): AppState,
    Path(job_id): Path<JobId>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(controller.jobs.cancel(job_id).await?))
}

async fn job_logs(
    State(controller): AppState,
    Path(job_id): Path<JobId>,
) -> Result<String, ApiError> {
    // 404 for unknown jobs rather than an empty log.
    controller.jobs.get(job_id).await?;
    let bytes: Vec<u8> = controller
        .jobs
        .logs(job_id)
        .into_iter()
        .flat_map(|chunk| chunk.data)
        .collect();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn metrics(State(controller): AppState) -> Result<String, ApiError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&controller.metrics.gather(), &mut buffer)
        .map_err(|e| ApiError::Metrics(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| ApiError::Metrics(e.to_string()))
}

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/{agent_id}", delete(remove_agent))
        .route("/agents/{agent_id}/session", delete(kick_agent))
        .route("/agents/{agent_id}/ping", post(ping_agent))
        .route("/agents/{agent_id}/state", put(put_desired_state))
        .route("/agents/{agent_id}/actions", post(start_action))
        .route("/agents/{agent_id}/actions/{action_id}/stop", post(stop_action))
        .route("/agents/{agent_id}/jobs", post(submit_job))
        .route("/actions/{action_id}", get(get_action))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
        .route("/jobs/{job_id}/logs", get(job_logs))
        .route("/reconcile", post(reconcile_all))
        .route("/metrics", get(metrics))
        .with_state(controller)
}
