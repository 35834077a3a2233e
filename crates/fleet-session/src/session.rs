//! One agent's duplex stream.
//!
//! A session owns the transport exclusively. Reads happen only on the receive
//! task and writes only on the send task; everything else talks to the session
//! through the bounded outbound queue and the pending-request table.
//!
//! ```text
//! Connecting --> Active --> Draining --> Closed
//!                   \___________________/
//! ```
//!
//! Transitions are one-way. A reconnecting agent gets a brand-new session.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fleet_core::{
    AgentEvent, AgentId, AgentIdentity, AgentMessage, CloseReason, DispatchError, Notification,
    NotificationHub, PayloadKind, RequestId, RequestPayload, ResponsePayload, ServerMessage,
    SessionId, TransportError, config::SessionConfig, message::AgentResponse, traits::AuthError,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    sync::{Notify, mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use uuid::Uuid;

use crate::SessionRegistry;

/// Inbound half of an agent transport.
pub trait AgentStream: Stream<Item = Result<AgentMessage, TransportError>> + Send + Unpin + 'static {}

impl<T> AgentStream for T where
    T: Stream<Item = Result<AgentMessage, TransportError>> + Send + Unpin + 'static
{
}

/// Outbound half of an agent transport.
pub trait AgentSink: Sink<ServerMessage, Error = TransportError> + Send + Unpin + 'static {}

impl<T> AgentSink for T where T: Sink<ServerMessage, Error = TransportError> + Send + Unpin + 'static {}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Handshake in progress.
    Connecting,
    /// Steady state.
    Active,
    /// Closure initiated; no new requests accepted.
    Draining,
    /// Terminal.
    Closed,
}

/// Handshake failure. The stream is dropped and no session is registered.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Stream ended before handshake")]
    ClosedBeforeHandshake,
    #[error("Expected hello, got {0}")]
    UnexpectedMessage(String),
    #[error("Transport error during handshake: {0}")]
    Transport(#[from] TransportError),
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
}

/// Snapshot of per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    /// Messages written to the agent.
    pub sent: u64,
    /// Messages read from the agent.
    pub received: u64,
    /// Requests awaiting a response.
    pub pending: usize,
    /// Messages waiting in the outbound queue.
    pub queued: usize,
}

type ResultSlot = oneshot::Sender<Result<ResponsePayload, DispatchError>>;

struct PendingRequest {
    expected: PayloadKind,
    deadline: Instant,
    slot: ResultSlot,
}

/// Controller-side object owning one agent's live stream.
pub struct StreamSession {
    id: SessionId,
    identity: AgentIdentity,
    connected_at: Instant,
    status: watch::Sender<SessionStatus>,
    close_reason: OnceLock<CloseReason>,

    outbound: mpsc::Sender<ServerMessage>,
    // `None` once closed: no more subscriptions.
    pending: Mutex<Option<HashMap<RequestId, PendingRequest>>>,
    pending_idle: Notify,
    max_in_flight: usize,

    last_request_id: AtomicU64,
    last_ping_id: AtomicU64,
    last_activity_ms: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,

    registry: Weak<SessionRegistry>,
    hub: Arc<NotificationHub>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("agent_id", &self.identity.agent_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Create a session in `Connecting` state, returning the outbound queue's receiving end.
    pub(crate) fn new(
        identity: AgentIdentity,
        config: &SessionConfig,
        registry: Weak<SessionRegistry>,
        hub: Arc<NotificationHub>,
    ) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (status, _) = watch::channel(SessionStatus::Connecting);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            identity,
            connected_at: Instant::now(),
            status,
            close_reason: OnceLock::new(),
            outbound,
            pending: Mutex::new(Some(HashMap::new())),
            pending_idle: Notify::new(),
            max_in_flight: config.max_in_flight.max(1),
            last_request_id: AtomicU64::new(0),
            last_ping_id: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            registry,
            hub,
        });
        (session, outbound_rx)
    }

    /// Move to `Active` and start the receive and send tasks.
    pub(crate) fn start<S, K>(
        self: &Arc<Self>,
        stream: S,
        sink: K,
        outbound_rx: mpsc::Receiver<ServerMessage>,
        config: &SessionConfig,
    ) where
        S: AgentStream,
        K: AgentSink,
    {
        tokio::spawn(Arc::clone(self).run_receiver(stream));
        tokio::spawn(Arc::clone(self).run_sender(
            sink,
            outbound_rx,
            config.ping_interval(),
            config.keepalive_timeout(),
            config.drain_grace(),
        ));
    }

    pub(crate) fn activate(&self) {
        self.status.send_if_modified(|status| {
            if *status == SessionStatus::Connecting {
                *status = SessionStatus::Active;
                true
            } else {
                false
            }
        });
    }

    /// Session instance id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn agent_id(&self) -> &AgentId {
        &self.identity.agent_id
    }

    #[must_use]
    pub const fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Why the session closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().cloned()
    }

    /// Instant of the last message received from the agent.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.connected_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_pending().as_ref().map_or(0, HashMap::len)
    }

    #[must_use]
    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            pending: self.pending_count(),
            queued: self
                .outbound
                .max_capacity()
                .saturating_sub(self.outbound.capacity()),
        }
    }

    /// Wait until the session is closed and return the reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.status.subscribe();
        wait_closed(&mut rx).await;
        self.close_reason().unwrap_or(CloseReason::Disconnected)
    }

    /// Register a pending request and enqueue it on the outbound queue.
    ///
    /// # Errors
    /// `ConnectionError` if the session is not `Active`, `Backpressure` if the
    /// in-flight limit is reached or the outbound queue is full.
    pub(crate) fn request(
        self: &Arc<Self>,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<InFlight, DispatchError> {
        if self.status() != SessionStatus::Active {
            return Err(self.connection_error());
        }

        let request_id = self.next_request_id();
        let expected = payload.kind();
        let deadline = Instant::now() + timeout;
        let (slot, rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            let Some(table) = pending.as_mut() else {
                return Err(self.connection_error());
            };
            if table.len() >= self.max_in_flight {
                return Err(DispatchError::Backpressure);
            }
            if table.contains_key(&request_id) {
                // only on request id wrap-around
                tracing::error!(agent_id = %self.agent_id(), request_id, "Request id already in flight");
                return Err(DispatchError::Backpressure);
            }
            table.insert(
                request_id,
                PendingRequest {
                    expected,
                    deadline,
                    slot,
                },
            );
        }

        // From here on the guard owns removal of the entry on every exit path.
        let in_flight = InFlight {
            session: Arc::clone(self),
            request_id,
            deadline,
            timeout,
            rx,
        };

        match self.outbound.try_send(ServerMessage::Request {
            request_id,
            payload,
        }) {
            Ok(()) => Ok(in_flight),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(agent_id = %self.agent_id(), request_id, "Outbound queue is full");
                Err(DispatchError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.connection_error()),
        }
    }

    /// Begin draining: refuse new requests, give in-flight requests up to
    /// `grace` to finish, then close.
    pub async fn drain(&self, grace: Duration) {
        let draining = self.status.send_if_modified(|status| {
            if matches!(*status, SessionStatus::Connecting | SessionStatus::Active) {
                *status = SessionStatus::Draining;
                true
            } else {
                false
            }
        });
        if !draining {
            return;
        }
        tracing::info!(agent_id = %self.agent_id(), session_id = %self.id, "Draining session");

        let deadline = Instant::now() + grace;
        loop {
            let idle = self.pending_idle.notified();
            if self.pending_count() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                tracing::warn!(
                    agent_id = %self.agent_id(),
                    pending = self.pending_count(),
                    "Drain grace period elapsed with requests in flight"
                );
                break;
            }
        }
        self.close(CloseReason::Drained);
    }

    /// Mark the session closed with the given reason - only once.
    ///
    /// Resolves every pending request with `ConnectionError`, removes the
    /// registry entry if it is still this session, and stops both tasks.
    pub fn close(&self, reason: CloseReason) {
        if self.close_reason.set(reason.clone()).is_err() {
            return;
        }
        match &reason {
            CloseReason::Protocol(_) | CloseReason::Transport(_) => {
                tracing::warn!(agent_id = %self.agent_id(), session_id = %self.id, %reason, "Closing session");
            }
            _ => {
                tracing::info!(agent_id = %self.agent_id(), session_id = %self.id, %reason, "Closing session");
            }
        }

        self.status.send_replace(SessionStatus::Closed);

        let drained = self.lock_pending().take().unwrap_or_default();
        for (_, entry) in drained {
            let _ = entry
                .slot
                .send(Err(DispatchError::ConnectionError(reason.to_string())));
        }
        self.pending_idle.notify_waiters();

        if let Some(registry) = self.registry.upgrade() {
            registry.session_closed(self, &reason);
        }
        self.hub.publish(Notification {
            agent_id: self.agent_id().clone(),
            session_id: self.id,
            event: AgentEvent::SessionClosed(reason),
        });
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<HashMap<RequestId, PendingRequest>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_request_id(&self) -> RequestId {
        self.last_request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn connection_error(&self) -> DispatchError {
        let reason = self
            .close_reason()
            .map_or_else(|| "session is draining".to_string(), |r| r.to_string());
        DispatchError::ConnectionError(reason)
    }

    /// Remove a pending entry without resolving it (caller gave up).
    fn forget(&self, request_id: RequestId) {
        let mut pending = self.lock_pending();
        if let Some(table) = pending.as_mut() {
            if table.remove(&request_id).is_some() && table.is_empty() {
                self.pending_idle.notify_waiters();
            }
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.connected_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    fn publish(&self, event: AgentEvent) {
        self.hub.publish(Notification {
            agent_id: self.agent_id().clone(),
            session_id: self.id,
            event,
        });
    }

    /// Match a response against the pending table.
    fn resolve(&self, response: AgentResponse) -> Result<(), CloseReason> {
        let request_id = response.request_id;
        let entry = {
            let mut pending = self.lock_pending();
            let Some(table) = pending.as_mut() else {
                return Ok(());
            };
            let entry = table.remove(&request_id);
            if entry.is_some() && table.is_empty() {
                self.pending_idle.notify_waiters();
            }
            entry
        };

        let Some(entry) = entry else {
            if request_id != self.last_ping_id.load(Ordering::Relaxed) {
                tracing::debug!(agent_id = %self.agent_id(), request_id, "Discarding response with no waiter");
            }
            return Ok(());
        };
        if Instant::now() > entry.deadline {
            tracing::debug!(agent_id = %self.agent_id(), request_id, "Response arrived after deadline");
        }

        match (response.error, response.payload) {
            (Some(message), _) => {
                tracing::warn!(agent_id = %self.agent_id(), request_id, %message, "Agent returned error");
                let _ = entry.slot.send(Err(DispatchError::Rejected(message)));
                Ok(())
            }
            (None, Some(payload)) if payload.kind() == entry.expected => {
                let _ = entry.slot.send(Ok(payload));
                Ok(())
            }
            (None, payload) => {
                let reason = CloseReason::Protocol(format!(
                    "response {request_id} carries {:?}, expected {}",
                    payload.map(|p| p.kind().as_str()),
                    entry.expected.as_str()
                ));
                let _ = entry
                    .slot
                    .send(Err(DispatchError::ConnectionError(reason.to_string())));
                Err(reason)
            }
        }
    }

    fn handle_incoming(&self, msg: AgentMessage) -> Result<(), CloseReason> {
        match msg {
            AgentMessage::Hello(_) => Err(CloseReason::Protocol("unexpected hello".to_string())),
            AgentMessage::Ping { request_id } => {
                let pong = ServerMessage::Pong {
                    request_id,
                    current_time_ms: unix_millis(),
                };
                if self.outbound.try_send(pong).is_err() {
                    tracing::warn!(agent_id = %self.agent_id(), request_id, "Dropping pong, outbound queue is full");
                }
                Ok(())
            }
            AgentMessage::Response(response) => self.resolve(response),
            AgentMessage::StateChanged(state) => {
                self.publish(AgentEvent::StateChanged(state));
                Ok(())
            }
            AgentMessage::ActionResult(result) => {
                self.publish(AgentEvent::ActionResult(result));
                Ok(())
            }
            AgentMessage::JobProgress(progress) => {
                self.publish(AgentEvent::JobProgress(progress));
                Ok(())
            }
            AgentMessage::JobResult(result) => {
                self.publish(AgentEvent::JobResult(result));
                Ok(())
            }
        }
    }

    /// Receive task: the only reader of the stream.
    async fn run_receiver<S: AgentStream>(self: Arc<Self>, mut stream: S) {
        let mut status = self.status.subscribe();
        loop {
            let next = tokio::select! {
                () = wait_closed(&mut status) => break,
                next = stream.next() => next,
            };
            match next {
                None => {
                    self.close(CloseReason::Disconnected);
                    break;
                }
                Some(Err(err)) => {
                    self.close(err.into());
                    break;
                }
                Some(Ok(msg)) => {
                    self.touch();
                    self.received.fetch_add(1, Ordering::Relaxed);
                    if tracing::enabled!(tracing::Level::TRACE) {
                        tracing::trace!(agent_id = %self.agent_id(), ?msg, "Received message");
                    }
                    if let Err(reason) = self.handle_incoming(msg) {
                        self.close(reason);
                        break;
                    }
                }
            }
        }
        tracing::debug!(agent_id = %self.agent_id(), session_id = %self.id, "Exiting receiver task");
    }

    /// Send task: the only writer of the stream. Also drives keepalive.
    async fn run_sender<K: AgentSink>(
        self: Arc<Self>,
        mut sink: K,
        mut outbound: mpsc::Receiver<ServerMessage>,
        ping_interval: Duration,
        keepalive_timeout: Duration,
        close_timeout: Duration,
    ) {
        let mut status = self.status.subscribe();
        let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let msg = tokio::select! {
                biased;
                () = wait_closed(&mut status) => break,
                msg = outbound.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = ticker.tick() => {
                    let idle = self.idle_for();
                    if idle >= keepalive_timeout {
                        self.close(CloseReason::KeepaliveTimeout(idle));
                        break;
                    }
                    let request_id = self.next_request_id();
                    self.last_ping_id.store(request_id, Ordering::Relaxed);
                    ServerMessage::Request { request_id, payload: RequestPayload::Ping }
                }
            };

            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::trace!(agent_id = %self.agent_id(), ?msg, "Sending message");
            }
            let sent = tokio::select! {
                () = wait_closed(&mut status) => break,
                sent = sink.send(msg) => sent,
            };
            if let Err(err) = sent {
                self.close(CloseReason::Transport(format!("failed to send message: {err}")));
                break;
            }
            self.sent.fetch_add(1, Ordering::Relaxed);
        }

        // A dead peer may never finish the close handshake.
        if tokio::time::timeout(close_timeout, sink.close()).await.is_err() {
            tracing::debug!(agent_id = %self.agent_id(), session_id = %self.id, ?close_timeout, "Timed out closing stream");
        }
        tracing::debug!(agent_id = %self.agent_id(), session_id = %self.id, "Exiting sender task");
    }

    pub(crate) fn publish_opened(&self) {
        self.publish(AgentEvent::SessionOpened);
    }
}

/// A registered pending request.
///
/// Dropping it (caller cancellation) removes the pending entry without
/// touching the session or other requests.
pub(crate) struct InFlight {
    session: Arc<StreamSession>,
    request_id: RequestId,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Result<ResponsePayload, DispatchError>>,
}

impl InFlight {
    pub(crate) const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the response, the deadline, or session closure.
    pub(crate) async fn wait(mut self) -> Result<ResponsePayload, DispatchError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.session.connection_error()),
            Err(_) => Err(DispatchError::Timeout(self.timeout)),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.session.forget(self.request_id);
    }
}

async fn wait_closed(rx: &mut watch::Receiver<SessionStatus>) {
    loop {
        let closed = *rx.borrow_and_update() == SessionStatus::Closed;
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
