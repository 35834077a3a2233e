//! Services built on top of agent dispatch.
//!
//! Provides:
//! - `DebounceSignal` / `run_debounced` - Single-slot pending signal + delay-then-act loop
//! - `StateReconciler` - Coalesced pushes of an agent's desired configuration
//! - `ActionService` - Short-lived diagnostic actions with asynchronous results
//! - `JobService` - Persisted long-running jobs with retry on reconnect
//! - `ForwardingLayer` - Routing requests to the replica that owns an agent's stream

pub mod actions;
pub mod debounce;
pub mod forwarding;
pub mod jobs;
pub mod reconciler;

pub use actions::{ActionError, ActionResultView, ActionService, ActionSpec};
pub use debounce::{DebounceSignal, Flush, run_debounced};
pub use forwarding::{
    ClusterDirectory, ClusterMembership, ForwardRequest, ForwardResponse, ForwardingLayer,
    InMemoryDirectory, ReplicaClient, ReplicaError, ReplicaId, StaticMembership,
};
pub use jobs::{JobError, JobService, JobSpec};
pub use reconciler::StateReconciler;

/// Receiver that ends a service's `run` loop when a value is sent or every
/// sender is dropped.
pub type StopReceiver = tokio::sync::broadcast::Receiver<()>;
