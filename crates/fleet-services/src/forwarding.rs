//! Cross-replica request routing.
//!
//! An agent holds exactly one stream, to one replica. A dispatch arriving at
//! any other replica is relayed to the owner through [`ReplicaClient`] and the
//! result relayed back. A relayed request is served locally only and never
//! relayed again; a request that claims more than one hop is refused as a
//! routing loop caused by stale directory data.
//!
//! Owner failure mid-request fails fast with `ConnectionError`; callers retry
//! after the directory catches up.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use fleet_core::{
    AgentEvent, AgentId, Dispatch, DispatchError, NotificationHub, RequestPayload,
    ResponsePayload, Topic, config::ForwardingConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::StopReceiver;

/// Identifier of a controller replica.
pub type ReplicaId = String;

/// Cluster-wide map of agent to owning replica.
///
/// Eventually consistent: a lookup may name a replica that has since lost the
/// agent.
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    async fn owner_of(&self, agent_id: &AgentId) -> Option<ReplicaId>;

    async fn set_owner(&self, agent_id: &AgentId, replica: &ReplicaId);

    /// Remove the entry only if `replica` still owns it.
    async fn remove_owner(&self, agent_id: &AgentId, replica: &ReplicaId);
}

/// Directory kept in process memory; replicas share it through an `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    owners: RwLock<HashMap<AgentId, ReplicaId>>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterDirectory for InMemoryDirectory {
    async fn owner_of(&self, agent_id: &AgentId) -> Option<ReplicaId> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    async fn set_owner(&self, agent_id: &AgentId, replica: &ReplicaId) {
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.clone(), replica.clone());
    }

    async fn remove_owner(&self, agent_id: &AgentId, replica: &ReplicaId) {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        if owners.get(agent_id) == Some(replica) {
            owners.remove(agent_id);
        }
    }
}

/// Who this replica is and how to reach its peers.
pub trait ClusterMembership: Send + Sync {
    fn self_id(&self) -> &ReplicaId;

    /// Whether this replica currently holds cluster leadership.
    fn is_leader(&self) -> bool;

    /// Base address of a peer's internal endpoint.
    fn replica_address(&self, replica: &ReplicaId) -> Option<String>;
}

/// Fixed membership from configuration.
#[derive(Debug, Clone)]
pub struct StaticMembership {
    self_id: ReplicaId,
    leader: bool,
    addresses: HashMap<ReplicaId, String>,
}

impl StaticMembership {
    #[must_use]
    pub fn new(self_id: impl Into<ReplicaId>, leader: bool) -> Self {
        Self {
            self_id: self_id.into(),
            leader,
            addresses: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_peer(mut self, replica: impl Into<ReplicaId>, address: impl Into<String>) -> Self {
        self.addresses.insert(replica.into(), address.into());
        self
    }
}

impl ClusterMembership for StaticMembership {
    fn self_id(&self) -> &ReplicaId {
        &self.self_id
    }

    fn is_leader(&self) -> bool {
        self.leader
    }

    fn replica_address(&self, replica: &ReplicaId) -> Option<String> {
        self.addresses.get(replica).cloned()
    }
}

/// Replica-to-replica request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub target_agent_id: AgentId,
    pub protocol_version: u32,
    /// Times this request has been relayed; at most 1.
    pub hops: u32,
    pub timeout_ms: u64,
    pub payload: RequestPayload,
}

impl ForwardRequest {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Relayed result, or the owner's structured error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForwardResponse {
    Ok { payload: ResponsePayload },
    Error { code: String, message: String },
}

impl ForwardResponse {
    #[must_use]
    pub fn from_result(result: Result<ResponsePayload, DispatchError>) -> Self {
        match result {
            Ok(payload) => Self::Ok { payload },
            Err(err) => Self::Error {
                code: err.code().to_string(),
                message: match err {
                    DispatchError::ConnectionError(message)
                    | DispatchError::Rejected(message)
                    | DispatchError::Forwarding(message) => message,
                    other => other.to_string(),
                },
            },
        }
    }

    /// Rebuild the dispatch result on the calling replica.
    ///
    /// # Errors
    ///
    /// The error the owning replica reported.
    pub fn into_result(
        self,
        agent_id: &AgentId,
        timeout: Duration,
    ) -> Result<ResponsePayload, DispatchError> {
        let (code, message) = match self {
            Self::Ok { payload } => return Ok(payload),
            Self::Error { code, message } => (code, message),
        };
        Err(match code.as_str() {
            "not_connected" => DispatchError::NotConnected(agent_id.clone()),
            "connection_error" => DispatchError::ConnectionError(message),
            "timeout" => DispatchError::Timeout(timeout),
            "backpressure" => DispatchError::Backpressure,
            "rejected" => DispatchError::Rejected(message),
            "forwarding_loop" => DispatchError::ForwardingLoop,
            _ => DispatchError::Forwarding(message),
        })
    }
}

/// Failure to get any answer from a peer replica.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("replica unreachable: {0}")]
    Unreachable(String),
    #[error("invalid replica response: {0}")]
    Protocol(String),
}

/// Transport to a peer replica's forwarding endpoint.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    async fn forward(
        &self,
        address: &str,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResponse, ReplicaError>;
}

/// Dispatch that falls back to the owning replica for agents not connected here.
pub struct ForwardingLayer {
    local: Arc<dyn Dispatch>,
    directory: Arc<dyn ClusterDirectory>,
    membership: Arc<dyn ClusterMembership>,
    client: Arc<dyn ReplicaClient>,
    hub: Arc<NotificationHub>,
    config: ForwardingConfig,
}

impl ForwardingLayer {
    #[must_use]
    pub fn new(
        local: Arc<dyn Dispatch>,
        directory: Arc<dyn ClusterDirectory>,
        membership: Arc<dyn ClusterMembership>,
        client: Arc<dyn ReplicaClient>,
        hub: Arc<NotificationHub>,
        config: ForwardingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            directory,
            membership,
            client,
            hub,
            config,
        })
    }

    #[must_use]
    pub fn replica_id(&self) -> &ReplicaId {
        self.membership.self_id()
    }

    /// Dispatch locally if the agent is connected here, otherwise relay to its owner.
    ///
    /// # Errors
    ///
    /// `NotConnected` if no replica owns the agent, `ConnectionError` if the
    /// owner cannot be reached, or whatever the owner reported.
    #[tracing::instrument(skip(self, payload, timeout), fields(kind = ?payload.kind()))]
    pub async fn route(
        &self,
        agent_id: &AgentId,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<ResponsePayload, DispatchError> {
        if self.local.is_connected(agent_id) {
            match self.local.dispatch(agent_id, payload.clone(), timeout).await {
                Err(DispatchError::NotConnected(_)) => {
                    tracing::debug!("Session vanished before dispatch, trying owner");
                }
                result => return result,
            }
        }
        if !self.config.enabled {
            return Err(DispatchError::NotConnected(agent_id.clone()));
        }

        let Some(owner) = self.directory.owner_of(agent_id).await else {
            return Err(DispatchError::NotConnected(agent_id.clone()));
        };
        if &owner == self.membership.self_id() {
            // Stale entry naming us; the session is gone.
            return Err(DispatchError::NotConnected(agent_id.clone()));
        }
        let Some(address) = self.membership.replica_address(&owner) else {
            return Err(DispatchError::ConnectionError(format!(
                "no address for replica {owner}"
            )));
        };

        let request = ForwardRequest {
            target_agent_id: agent_id.clone(),
            protocol_version: self.config.protocol_version,
            hops: 1,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            payload: payload.clone(),
        };
        tracing::debug!(%owner, %address, "Forwarding request");
        let deadline = timeout.max(self.config.timeout());
        let result = match self.client.forward(&address, request, deadline).await {
            Ok(response) => response.into_result(agent_id, timeout),
            Err(ReplicaError::Unreachable(err)) => {
                tracing::warn!(%owner, error = %err, "Owning replica unreachable");
                Err(DispatchError::ConnectionError(err))
            }
            Err(ReplicaError::Protocol(err)) => {
                tracing::warn!(%owner, error = %err, "Bad response from owning replica");
                Err(DispatchError::Forwarding(err))
            }
        };

        match result {
            Err(err) if err.is_retryable() && self.local.is_connected(agent_id) => {
                tracing::info!(error = %err, "Agent connected here meanwhile, retrying locally");
                self.local.dispatch(agent_id, payload, timeout).await
            }
            result => result,
        }
    }

    /// Handle a request relayed by a peer. Never relays further.
    #[tracing::instrument(skip_all, fields(agent_id = %request.target_agent_id, hops = request.hops))]
    pub async fn serve(&self, request: ForwardRequest) -> ForwardResponse {
        if request.protocol_version != self.config.protocol_version {
            tracing::warn!(
                version = request.protocol_version,
                expected = self.config.protocol_version,
                "Forwarding protocol version mismatch"
            );
            return ForwardResponse::from_result(Err(DispatchError::Forwarding(format!(
                "unsupported protocol version {} (expected {})",
                request.protocol_version, self.config.protocol_version
            ))));
        }
        if request.hops > 1 {
            tracing::warn!("Refusing request relayed more than once");
            return ForwardResponse::from_result(Err(DispatchError::ForwardingLoop));
        }

        let timeout = request.timeout();
        let result = self
            .local
            .dispatch(&request.target_agent_id, request.payload, timeout)
            .await;
        ForwardResponse::from_result(result)
    }

    /// Keep the directory in step with local session lifecycle until `stop` fires.
    #[tracing::instrument(skip_all, fields(replica_id = %self.membership.self_id()))]
    pub async fn run(self: Arc<Self>, mut stop: StopReceiver) {
        let mut events = self.hub.subscribe(&[Topic::Lifecycle]);
        let self_id = self.membership.self_id().clone();
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                notification = events.recv() => {
                    let Some(notification) = notification else { break };
                    let agent_id = &notification.agent_id;
                    match notification.event {
                        AgentEvent::SessionOpened => {
                            self.directory.set_owner(agent_id, &self_id).await;
                        }
                        // A replacing session may already be registered.
                        AgentEvent::SessionClosed(_) if !self.local.is_connected(agent_id) => {
                            self.directory.remove_owner(agent_id, &self_id).await;
                        }
                        _ => {}
                    }
                }
            }
        }
        tracing::debug!("Forwarding directory updates stopped");
    }
}

#[async_trait]
impl Dispatch for ForwardingLayer {
    async fn dispatch(
        &self,
        agent_id: &AgentId,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<ResponsePayload, DispatchError> {
        self.route(agent_id, payload, timeout).await
    }

    /// Local sessions only; remote ownership needs a directory lookup.
    fn is_connected(&self, agent_id: &AgentId) -> bool {
        self.local.is_connected(agent_id)
    }
}
