//! Collaborator traits and the persisted job model.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    AgentId, AgentIdentity, DispatchError,
    message::{Hello, RequestPayload, ResponsePayload, SetStateRequest},
};

/// Session instance identifier. A reconnecting agent gets a new one.
pub type SessionId = Uuid;

/// Job identifier, independent of any session.
pub type JobId = Uuid;

/// Action identifier.
pub type ActionId = Uuid;

/// Seconds since the Unix epoch.
#[must_use]
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Issue a correlated request to an agent.
///
/// Implemented by the local dispatcher and by the forwarding layer, so
/// services do not care which replica owns the agent's stream.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Send `payload` to `agent_id` and wait for the matching response.
    async fn dispatch(
        &self,
        agent_id: &AgentId,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<ResponsePayload, DispatchError>;

    /// Whether a request to `agent_id` currently has somewhere to go.
    fn is_connected(&self, agent_id: &AgentId) -> bool;
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted, not yet accepted by the agent.
    Pending,
    /// Accepted by the agent.
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Persisted long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub agent_id: AgentId,
    #[serde(default)]
    pub params: Value,
    pub status: JobStatus,
    /// Dispatch attempts that failed and were retried.
    pub retries: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    /// Result artifact reference reported on success.
    pub artifact: Option<String>,
    pub error: Option<String>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

impl Job {
    /// New pending job.
    #[must_use]
    pub fn new(agent_id: AgentId, kind: impl Into<String>, params: Value) -> Self {
        let timestamp = now();
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            agent_id,
            params,
            status: JobStatus::Pending,
            retries: 0,
            max_retries: 0,
            timeout_ms: 0,
            artifact: None,
            error: None,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Move to `status`, bumping `updated_at`.
    pub fn transition(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = now();
    }
}

/// Job filter for queries.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub agent_id: Option<AgentId>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn create(&self, job: &Job) -> Result<(), StorageError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StorageError>;

    /// Overwrite a stored job.
    async fn update(&self, job: &Job) -> Result<(), StorageError>;

    /// List jobs, newest first.
    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, StorageError>;
}

/// Error while computing an agent's desired state.
#[derive(Debug, Error)]
pub enum StateSourceError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),
    #[error("Inventory error: {0}")]
    Inventory(String),
}

/// Source of the full desired configuration for an agent.
///
/// Backed by the inventory store in production.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn desired_state(&self, agent_id: &AgentId) -> Result<SetStateRequest, StateSourceError>;
}

/// Handshake rejection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Permission denied: {0}")]
    Denied(String),
    #[error("Invalid handshake: {0}")]
    Invalid(String),
}

/// Validates an agent's `hello` and produces its identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, hello: &Hello) -> Result<AgentIdentity, AuthError>;
}

/// Authenticator that admits any agent with a non-empty id.
#[derive(Debug, Default, Clone)]
pub struct AcceptAll;

#[async_trait]
impl Authenticator for AcceptAll {
    async fn authenticate(&self, hello: &Hello) -> Result<AgentIdentity, AuthError> {
        if hello.agent_id.is_empty() {
            return Err(AuthError::Denied("empty agent id".to_string()));
        }
        let metadata = hello
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(AgentIdentity::with_metadata(
            hello.agent_id.clone(),
            hello.version.clone(),
            metadata,
        ))
    }
}
