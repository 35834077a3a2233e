//! WebSocket acceptor for agent streams.
//!
//! Each upgraded socket is split into an [`AgentStream`] / [`AgentSink`] pair
//! and handed to [`SessionRegistry::accept`], which performs the handshake and
//! owns the socket from then on.
//!
//! [`AgentStream`]: fleet_session::AgentStream
//! [`AgentSink`]: fleet_session::AgentSink

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use fleet_core::{AgentMessage, ServerMessage, TransportError};
use fleet_session::SessionRegistry;
use futures::{SinkExt, StreamExt, future};

use crate::protocol::{self, MAX_FRAME_BYTES};

/// Route agents connect to.
pub const CONNECT_PATH: &str = "/agent/connect";

/// Agent WebSocket upgrade handler.
pub async fn connect_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| serve_agent(socket, registry))
}

/// Run one agent connection to completion.
pub async fn serve_agent(socket: WebSocket, registry: Arc<SessionRegistry>) {
    let (sink, stream) = socket.split();

    let stream = stream
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| future::ready(decode_frame(frame)));
    let sink = sink
        .sink_map_err(|e| TransportError::Io(e.to_string()))
        .with(|msg: ServerMessage| future::ready(encode_frame(&msg)));

    match registry.accept(stream, sink).await {
        Ok(session) => {
            session.closed().await;
            tracing::debug!(
                agent_id = %session.agent_id(),
                reason = ?session.close_reason(),
                "Agent socket finished"
            );
        }
        Err(err) => tracing::warn!(error = %err, "Agent connection rejected"),
    }
}

/// Map one WebSocket frame to an agent message; control frames yield nothing.
fn decode_frame(
    frame: Result<Message, axum::Error>,
) -> Option<Result<AgentMessage, TransportError>> {
    match frame {
        Ok(Message::Text(text)) => Some(protocol::decode_agent(text.as_str().as_bytes())),
        Ok(Message::Binary(data)) => Some(protocol::decode_agent(&data)),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
        Err(err) => Some(Err(TransportError::Io(err.to_string()))),
    }
}

fn encode_frame(msg: &ServerMessage) -> Result<Message, TransportError> {
    protocol::encode_server(msg).map(|text| Message::Text(text.into()))
}

/// Router exposing [`CONNECT_PATH`].
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(agent_router(Arc::clone(&registry)));
/// ```
#[must_use]
pub fn agent_router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route(CONNECT_PATH, get(connect_handler))
        .with_state(registry)
}
