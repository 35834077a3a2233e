//! Core abstractions for the agent fleet control plane.
//!
//! This crate provides the fundamental building blocks:
//! - `AgentId` / `AgentIdentity` - Who is on the other end of a stream
//! - `AgentMessage` / `ServerMessage` - Duplex wire envelope
//! - `DispatchError` / `CloseReason` - Error taxonomy shared by every layer
//! - `NotificationHub` - Fan-out of unsolicited agent notifications
//! - `LogStore` - Bounded history + live broadcast for job logs
//! - Collaborator traits (`Dispatch`, `JobStore`, `DesiredStateSource`, `Authenticator`)

pub mod config;
pub mod error;
pub mod identity;
pub mod log_store;
pub mod message;
pub mod notify;
pub mod traits;

pub use error::{CloseReason, DispatchError, TransportError};
pub use identity::{AgentId, AgentIdentity};
pub use log_store::{LogChunk, LogStore};
pub use message::{
    AgentMessage, PayloadKind, RequestId, RequestPayload, ResponsePayload, ServerMessage,
};
pub use notify::{AgentEvent, Notification, NotificationHub, Topic};
pub use traits::{
    ActionId, Authenticator, DesiredStateSource, Dispatch, Job, JobId, JobStatus, JobStore,
    SessionId,
};
