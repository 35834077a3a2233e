//! Authoritative map of agent id to live session.
//!
//! At most one session per agent id is registered at a time. A newer
//! connection from the same agent always replaces the older one, which is
//! closed with [`CloseReason::Evicted`].

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use fleet_core::{
    AgentId, AgentMessage, Authenticator, CloseReason, NotificationHub, ServerMessage, SessionId,
    config::SessionConfig,
    message::{Hello, Welcome},
};
use futures::{SinkExt, StreamExt, future};

use crate::{
    MetricsError,
    metrics::RegistryMetrics,
    session::{AgentSink, AgentStream, SessionError, StreamSession},
};

/// Registry of connected agents.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<AgentId, Arc<StreamSession>>>,
    config: SessionConfig,
    hub: Arc<NotificationHub>,
    authenticator: Arc<dyn Authenticator>,
    welcome: Welcome,
    metrics: RegistryMetrics,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("replica_id", &self.welcome.replica_id)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the metric descriptors are invalid.
    pub fn new(
        config: SessionConfig,
        hub: Arc<NotificationHub>,
        authenticator: Arc<dyn Authenticator>,
        welcome: Welcome,
    ) -> Result<Arc<Self>, MetricsError> {
        Ok(Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            hub,
            authenticator,
            welcome,
            metrics: RegistryMetrics::new()?,
        }))
    }

    pub(crate) const fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub const fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Run the handshake on a freshly opened stream and, on success,
    /// register and start a new session.
    ///
    /// Any previous session of the same agent is evicted.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] if the agent does not complete the
    /// handshake in time or fails authentication. Nothing is registered.
    #[tracing::instrument(skip_all)]
    pub async fn accept<S, K>(
        self: &Arc<Self>,
        mut stream: S,
        mut sink: K,
    ) -> Result<Arc<StreamSession>, SessionError>
    where
        S: AgentStream,
        K: AgentSink,
    {
        let hello = self.handshake(&mut stream).await?;
        let identity = match self.authenticator.authenticate(&hello).await {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(agent_id = %hello.agent_id, error = %err, "Agent failed authentication");
                return Err(err.into());
            }
        };
        sink.send(ServerMessage::Welcome(self.welcome.clone()))
            .await?;

        let (session, outbound_rx) = StreamSession::new(
            identity,
            &self.config,
            Arc::downgrade(self),
            Arc::clone(&self.hub),
        );
        session.activate();

        if let Some(previous) = self.register(Arc::clone(&session)) {
            previous.close(CloseReason::Evicted);
        }
        session.publish_opened();
        session.start(stream, sink, outbound_rx, &self.config);
        self.metrics.connects.inc();

        tracing::info!(
            agent_id = %session.agent_id(),
            session_id = %session.id(),
            version = %session.identity().version,
            "Agent connected"
        );
        Ok(session)
    }

    async fn handshake<S: AgentStream>(&self, stream: &mut S) -> Result<Hello, SessionError> {
        let timeout = self.config.handshake_timeout();
        match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => Err(SessionError::HandshakeTimeout(timeout)),
            Ok(None) => Err(SessionError::ClosedBeforeHandshake),
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(Some(Ok(AgentMessage::Hello(hello)))) => Ok(hello),
            Ok(Some(Ok(other))) => Err(SessionError::UnexpectedMessage(message_kind(&other).to_string())),
        }
    }

    /// Insert `session`, returning the session it replaced.
    ///
    /// The caller closes the replaced session; it is not closed here so that
    /// the registry lock is never held across session teardown.
    pub fn register(&self, session: Arc<StreamSession>) -> Option<Arc<StreamSession>> {
        let agent_id = session.agent_id().clone();
        let (previous, len) = {
            let mut sessions = self.write();
            let previous = sessions.insert(agent_id.clone(), session);
            (previous, sessions.len())
        };

        self.metrics.connected.set(i64::try_from(len).unwrap_or(i64::MAX));
        self.metrics
            .agent_connected
            .with_label_values(&[agent_id.as_str()])
            .set(1);

        if let Some(previous) = &previous {
            tracing::warn!(
                %agent_id,
                session_id = %previous.id(),
                "Another session is already registered for this agent, evicting it"
            );
        }
        previous
    }

    /// Remove the entry for `agent_id` only if it is still `session_id`.
    pub fn unregister(&self, agent_id: &AgentId, session_id: SessionId) -> Option<Arc<StreamSession>> {
        let (removed, len) = {
            let mut sessions = self.write();
            let removed = match sessions.get(agent_id) {
                Some(current) if current.id() == session_id => sessions.remove(agent_id),
                _ => None,
            };
            (removed, sessions.len())
        };

        if removed.is_some() {
            self.metrics.connected.set(i64::try_from(len).unwrap_or(i64::MAX));
            self.metrics
                .agent_connected
                .with_label_values(&[agent_id.as_str()])
                .set(0);
        }
        removed
    }

    /// Called by a session once it reaches `Closed`.
    pub(crate) fn session_closed(&self, session: &StreamSession, reason: &CloseReason) {
        self.metrics
            .disconnects
            .with_label_values(&[reason.label()])
            .inc();
        if self.unregister(session.agent_id(), session.id()).is_some() {
            tracing::info!(
                agent_id = %session.agent_id(),
                session_id = %session.id(),
                %reason,
                "Agent disconnected"
            );
        }
    }

    /// Current session of `agent_id`.
    #[must_use]
    pub fn lookup(&self, agent_id: &AgentId) -> Option<Arc<StreamSession>> {
        self.read().get(agent_id).cloned()
    }

    /// Whether `agent_id` has a registered session.
    #[must_use]
    pub fn is_connected(&self, agent_id: &AgentId) -> bool {
        self.read().contains_key(agent_id)
    }

    /// Ids of all connected agents.
    #[must_use]
    pub fn connected_agents(&self) -> Vec<AgentId> {
        self.read().keys().cloned().collect()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<StreamSession>> {
        self.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Forcibly close the session of `agent_id`.
    ///
    /// Returns `false` if the agent was not connected.
    pub fn kick(&self, agent_id: &AgentId) -> bool {
        let Some(session) = self.lookup(agent_id) else {
            return false;
        };
        tracing::info!(%agent_id, session_id = %session.id(), "Kicking agent");
        session.close(CloseReason::Kicked);
        true
    }

    /// Kick every connected agent.
    pub fn kick_all(&self) {
        for session in self.sessions() {
            session.close(CloseReason::Kicked);
        }
    }

    /// Drain every session concurrently, each with the given grace period.
    pub async fn drain_all(&self, grace: Duration) {
        let sessions = self.sessions();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(sessions = sessions.len(), ?grace, "Draining all sessions");
        future::join_all(sessions.iter().map(|session| session.drain(grace))).await;
    }

    /// Kick the agent and drop its per-agent metric series.
    ///
    /// Used once an agent is removed from inventory.
    pub fn forget(&self, agent_id: &AgentId) {
        self.kick(agent_id);
        self.metrics.forget(agent_id.as_str());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<AgentId, Arc<StreamSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<AgentId, Arc<StreamSession>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

const fn message_kind(msg: &AgentMessage) -> &'static str {
    match msg {
        AgentMessage::Hello(_) => "hello",
        AgentMessage::Ping { .. } => "ping",
        AgentMessage::Response(_) => "response",
        AgentMessage::StateChanged(_) => "state_changed",
        AgentMessage::ActionResult(_) => "action_result",
        AgentMessage::JobProgress(_) => "job_progress",
        AgentMessage::JobResult(_) => "job_result",
    }
}
