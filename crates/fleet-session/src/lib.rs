//! Agent stream sessions and request dispatch.
//!
//! Provides:
//! - `SessionRegistry` - Authoritative agent id -> live session map
//! - `StreamSession` - One agent's duplex stream (receive task, send task, correlation table)
//! - `RequestDispatcher` - Correlated request/response over a session
//! - Job storage implementations (memory)

pub mod dispatcher;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dispatcher::RequestDispatcher;
pub use metrics::{MetricsError, RegistryCollector};
pub use registry::SessionRegistry;
pub use session::{
    AgentSink, AgentStream, SessionError, SessionMetrics, SessionStatus, StreamSession,
};
#[cfg(feature = "memory")]
pub use storage::MemoryJobStore;
