//! Duplex wire envelope between the controller and agents.
//!
//! Every message carries a `kind` tag. Request/response pairs additionally
//! carry a numeric `request_id`, unique within one session.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ActionId, AgentId, JobId};

/// Request identifier, monotonically assigned per session.
pub type RequestId = u64;

/// Message from agent to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Identity handshake; must be the first message on a stream.
    Hello(Hello),
    /// Agent-side keepalive, answered with [`ServerMessage::Pong`].
    Ping { request_id: RequestId },
    /// Response to a controller request.
    Response(AgentResponse),
    /// Unsolicited report of the agent's running processes.
    StateChanged(StateChanged),
    /// Output (possibly partial) of a running action.
    ActionResult(ActionResult),
    /// Log chunk of a running job.
    JobProgress(JobProgress),
    /// Terminal outcome of a job.
    JobResult(JobResult),
}

/// Message from controller to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgement.
    Welcome(Welcome),
    /// Correlated request.
    Request {
        request_id: RequestId,
        payload: RequestPayload,
    },
    /// Answer to an agent-side ping.
    Pong {
        request_id: RequestId,
        current_time_ms: i64,
    },
}

/// Agent handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub agent_id: AgentId,
    pub version: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Controller handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub server_version: String,
    pub replica_id: String,
}

/// Kind of a request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Ping,
    SetState,
    StartAction,
    StopAction,
    StartJob,
    StopJob,
}

impl PayloadKind {
    /// Stable name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::SetState => "set_state",
            Self::StartAction => "start_action",
            Self::StopAction => "stop_action",
            Self::StartJob => "start_job",
            Self::StopJob => "stop_job",
        }
    }
}

/// Controller request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPayload {
    Ping,
    SetState(SetStateRequest),
    StartAction(StartActionRequest),
    StopAction { action_id: ActionId },
    StartJob(StartJobRequest),
    StopJob { job_id: JobId },
}

impl RequestPayload {
    /// Kind of response this request expects.
    #[must_use]
    pub const fn kind(&self) -> PayloadKind {
        match self {
            Self::Ping => PayloadKind::Ping,
            Self::SetState(_) => PayloadKind::SetState,
            Self::StartAction(_) => PayloadKind::StartAction,
            Self::StopAction { .. } => PayloadKind::StopAction,
            Self::StartJob(_) => PayloadKind::StartJob,
            Self::StopJob { .. } => PayloadKind::StopJob,
        }
    }
}

/// Agent response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Pong { current_time_ms: i64 },
    SetState,
    StartAction,
    StopAction,
    StartJob,
    StopJob,
}

impl ResponsePayload {
    /// Kind of request this payload answers.
    #[must_use]
    pub const fn kind(&self) -> PayloadKind {
        match self {
            Self::Pong { .. } => PayloadKind::Ping,
            Self::SetState => PayloadKind::SetState,
            Self::StartAction => PayloadKind::StartAction,
            Self::StopAction => PayloadKind::StopAction,
            Self::StartJob => PayloadKind::StartJob,
            Self::StopJob => PayloadKind::StopJob,
        }
    }
}

/// Response envelope from agent.
///
/// Exactly one of `error` and `payload` is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ResponsePayload>,
}

impl AgentResponse {
    /// Successful response.
    #[must_use]
    pub const fn ok(request_id: RequestId, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            error: None,
            payload: Some(payload),
        }
    }

    /// Failed response.
    #[must_use]
    pub fn error(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            error: Some(message.into()),
            payload: None,
        }
    }
}

/// Full desired configuration of one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetStateRequest {
    /// Desired-state version this request delivers.
    pub version: u64,
    /// Supervised exporter processes, keyed by process id.
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessSpec>,
    /// In-process collectors, keyed by collector id.
    #[serde(default)]
    pub builtins: BTreeMap<String, Value>,
}

/// One supervised process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub kind: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartActionRequest {
    pub action_id: ActionId,
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub job_id: JobId,
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChanged {
    #[serde(default)]
    pub processes: Vec<ProcessStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub process_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

/// Action output chunk. The final chunk has `done` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: ActionId,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub done: bool,
}

/// Job log chunk (base64 encoded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub chunk_id: u32,
    pub data: String,
    #[serde(default)]
    pub done: bool,
}

impl JobProgress {
    /// Create a progress message from raw bytes.
    #[must_use]
    pub fn new(job_id: JobId, chunk_id: u32, data: &[u8], done: bool) -> Self {
        Self {
            job_id,
            chunk_id,
            data: BASE64.encode(data),
            done,
        }
    }

    /// Decode chunk data from base64.
    #[must_use]
    pub fn decode_data(&self) -> Option<Vec<u8>> {
        BASE64.decode(&self.data).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<String>,
    },
    Failed {
        message: String,
    },
}
