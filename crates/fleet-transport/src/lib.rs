//! Network bindings for the agent fleet control plane.
//!
//! Provides:
//! - Wire protocol (JSON text frames)
//! - Agent WebSocket acceptor (feature: websocket)
//! - Replica-to-replica forwarding endpoint and client (feature: forward)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "forward")]
pub mod forward;

pub use protocol::{decode_agent, decode_server, encode_agent, encode_server};
