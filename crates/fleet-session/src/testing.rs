//! In-memory agent endpoints for tests.
//!
//! [`duplex`] returns the controller's stream/sink pair plus a [`FakeAgent`]
//! driving the other side, so session and service tests run without sockets.

use std::sync::Arc;

use fleet_core::{
    AgentId, AgentMessage, NotificationHub, RequestId, RequestPayload, ResponsePayload,
    ServerMessage, TransportError,
    config::SessionConfig,
    message::{AgentResponse, Hello, Welcome},
    traits::AcceptAll,
};
use futures::{
    SinkExt, StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
};
use tokio::task::JoinHandle;

use crate::{AgentSink, AgentStream, SessionRegistry, StreamSession};

/// Version reported by fake agents.
pub const AGENT_VERSION: &str = "3.0.0-test";

/// Registry and hub wired together with an accept-all authenticator.
pub struct TestFleet {
    pub hub: Arc<NotificationHub>,
    pub registry: Arc<SessionRegistry>,
}

impl TestFleet {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    /// # Panics
    ///
    /// Panics if the registry metrics cannot be created.
    #[must_use]
    pub fn with_config(config: SessionConfig) -> Self {
        let hub = Arc::new(NotificationHub::new());
        let registry = SessionRegistry::new(
            config,
            Arc::clone(&hub),
            Arc::new(AcceptAll),
            Welcome {
                server_version: "test".to_string(),
                replica_id: "replica-test".to_string(),
            },
        )
        .expect("registry metrics");
        Self { hub, registry }
    }
}

impl Default for TestFleet {
    fn default() -> Self {
        Self::new()
    }
}

/// `hello` handshake for `agent_id`.
#[must_use]
pub fn hello(agent_id: &str) -> AgentMessage {
    AgentMessage::Hello(Hello {
        agent_id: AgentId::new(agent_id),
        version: AGENT_VERSION.to_string(),
        metadata: std::collections::BTreeMap::new(),
    })
}

/// Create a connected in-memory stream pair.
#[must_use]
pub fn duplex() -> (FakeAgent, impl AgentStream, impl AgentSink) {
    let (agent_tx, server_rx) = unbounded();
    let (server_tx, agent_rx) = unbounded::<ServerMessage>();
    let sink = server_tx.sink_map_err(|err| TransportError::Io(err.to_string()));
    (
        FakeAgent {
            tx: agent_tx,
            rx: agent_rx,
        },
        server_rx,
        sink,
    )
}

/// Open a stream for `agent_id`, complete the handshake and return the
/// registered session.
///
/// # Panics
///
/// Panics if the handshake fails.
pub async fn connect(registry: &Arc<SessionRegistry>, agent_id: &str) -> (Arc<StreamSession>, FakeAgent) {
    let (mut agent, stream, sink) = duplex();
    agent.send(hello(agent_id));
    let session = registry
        .accept(stream, sink)
        .await
        .expect("handshake should succeed");
    match agent.recv().await {
        Some(ServerMessage::Welcome(_)) => {}
        other => panic!("expected welcome, got {other:?}"),
    }
    (session, agent)
}

/// Default successful response for a request.
#[must_use]
pub const fn ok_response(payload: &RequestPayload) -> ResponsePayload {
    match payload {
        RequestPayload::Ping => ResponsePayload::Pong { current_time_ms: 0 },
        RequestPayload::SetState(_) => ResponsePayload::SetState,
        RequestPayload::StartAction(_) => ResponsePayload::StartAction,
        RequestPayload::StopAction { .. } => ResponsePayload::StopAction,
        RequestPayload::StartJob(_) => ResponsePayload::StartJob,
        RequestPayload::StopJob { .. } => ResponsePayload::StopJob,
    }
}

/// Cloneable handle for pushing agent messages into a stream.
#[derive(Clone)]
pub struct AgentSender(UnboundedSender<Result<AgentMessage, TransportError>>);

impl AgentSender {
    pub fn send(&self, msg: AgentMessage) {
        let _ = self.0.unbounded_send(Ok(msg));
    }
}

/// The agent side of an in-memory stream.
pub struct FakeAgent {
    tx: UnboundedSender<Result<AgentMessage, TransportError>>,
    rx: UnboundedReceiver<ServerMessage>,
}

impl FakeAgent {
    /// Send a message to the controller.
    pub fn send(&self, msg: AgentMessage) {
        let _ = self.tx.unbounded_send(Ok(msg));
    }

    /// Inject a transport-level failure.
    pub fn send_err(&self, err: TransportError) {
        let _ = self.tx.unbounded_send(Err(err));
    }

    /// Inject a frame that fails to decode.
    pub fn send_garbage(&self, raw: &str) {
        self.send_err(TransportError::Malformed(raw.to_string()));
    }

    #[must_use]
    pub fn sender(&self) -> AgentSender {
        AgentSender(self.tx.clone())
    }

    /// Next message from the controller, `None` once the controller closed the stream.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.next().await
    }

    /// Next request of any kind, keepalive pings included.
    ///
    /// # Panics
    ///
    /// Panics if the stream closes first.
    pub async fn next_request_any(&mut self) -> (RequestId, RequestPayload) {
        loop {
            match self.recv().await {
                Some(ServerMessage::Request {
                    request_id,
                    payload,
                }) => return (request_id, payload),
                Some(_) => {}
                None => panic!("stream closed while waiting for a request"),
            }
        }
    }

    /// Next request, skipping keepalive pings.
    ///
    /// # Panics
    ///
    /// Panics if the stream closes first.
    pub async fn next_request(&mut self) -> (RequestId, RequestPayload) {
        loop {
            let (request_id, payload) = self.next_request_any().await;
            if payload != RequestPayload::Ping {
                return (request_id, payload);
            }
        }
    }

    pub fn respond(&self, request_id: RequestId, payload: ResponsePayload) {
        self.send(AgentMessage::Response(AgentResponse::ok(request_id, payload)));
    }

    pub fn respond_error(&self, request_id: RequestId, message: &str) {
        self.send(AgentMessage::Response(AgentResponse::error(request_id, message)));
    }

    /// Close the agent side.
    pub fn disconnect(self) {
        drop(self);
    }

    /// Answer every request with `handler` until the stream closes.
    ///
    /// `handler` returns the response payload, or an error message.
    pub fn serve<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(&RequestPayload) -> Result<ResponsePayload, String> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(msg) = self.recv().await {
                let ServerMessage::Request {
                    request_id,
                    payload,
                } = msg
                else {
                    continue;
                };
                match handler(&payload) {
                    Ok(response) => self.respond(request_id, response),
                    Err(message) => self.respond_error(request_id, &message),
                }
            }
        })
    }

    /// Answer every request successfully.
    pub fn serve_ok(self) -> JoinHandle<()> {
        self.serve(|payload| Ok(ok_response(payload)))
    }
}
