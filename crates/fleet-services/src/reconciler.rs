//! Pushes each agent's full desired configuration, coalescing bursts.
//!
//! Every agent gets its own single-slot signal and debounced worker, so a
//! slow or failing agent never delays pushes to another one. A
//! [`DesiredStateMarker`] per agent records which desired version was last
//! delivered to the current session, which lets a worker skip a push that
//! would change nothing.
//!
//! Workers exist only while an agent is connected. When its session closes
//! (kick, eviction without a successor, deletion) the worker and marker are
//! dropped; the next session starts from a fresh marker.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use fleet_core::{
    AgentEvent, AgentId, DesiredStateSource, Dispatch, DispatchError, NotificationHub,
    RequestPayload, SessionId, Topic, config::ReconcilerConfig, traits::StateSourceError,
};
use tokio::{
    sync::mpsc,
    task::{AbortHandle, JoinSet},
};

use crate::{
    StopReceiver,
    debounce::{DebounceSignal, Flush, run_debounced},
};

/// Desired-state bookkeeping of one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesiredStateMarker {
    /// Bumped by every push request.
    pub desired: u64,
    /// Highest version acknowledged by the agent's current session.
    pub pushed: Option<u64>,
}

impl DesiredStateMarker {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.pushed.is_some_and(|pushed| pushed >= self.desired)
    }
}

struct AgentSlot {
    signal: DebounceSignal,
    marker: Mutex<DesiredStateMarker>,
}

impl AgentSlot {
    fn marker(&self) -> std::sync::MutexGuard<'_, DesiredStateMarker> {
        self.marker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type NewWorker = (AgentId, Arc<AgentSlot>, mpsc::Receiver<()>);

/// Coalesces configuration pushes to agents.
pub struct StateReconciler {
    dispatch: Arc<dyn Dispatch>,
    source: Arc<dyn DesiredStateSource>,
    hub: Arc<NotificationHub>,
    config: ReconcilerConfig,
    slots: Mutex<HashMap<AgentId, Arc<AgentSlot>>>,
    connected: Mutex<HashMap<AgentId, SessionId>>,
    new_workers: mpsc::UnboundedSender<NewWorker>,
    new_workers_rx: Mutex<Option<mpsc::UnboundedReceiver<NewWorker>>>,
}

impl StateReconciler {
    #[must_use]
    pub fn new(
        dispatch: Arc<dyn Dispatch>,
        source: Arc<dyn DesiredStateSource>,
        hub: Arc<NotificationHub>,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        let (new_workers, new_workers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            dispatch,
            source,
            hub,
            config,
            slots: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashMap::new()),
            new_workers,
            new_workers_rx: Mutex::new(Some(new_workers_rx)),
        })
    }

    /// Ask for the agent's desired state to be pushed. Fire-and-forget.
    ///
    /// Requests for agents that are not connected are dropped; the state is
    /// pushed when the agent connects.
    pub fn request_push(&self, agent_id: &AgentId) {
        if !self.dispatch.is_connected(agent_id) {
            tracing::debug!(%agent_id, "Agent is not connected, state will be pushed on connect");
            return;
        }
        let slot = self.slot(agent_id);
        slot.marker().desired += 1;
        if slot.signal.notify() {
            tracing::debug!(%agent_id, "State push requested");
        }
    }

    /// Request a push for every agent known to be connected.
    pub fn update_all(&self) {
        let agents: Vec<AgentId> = self
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tracing::debug!(agents = agents.len(), "Requesting state push for all agents");
        for agent_id in &agents {
            self.request_push(agent_id);
        }
    }

    /// Current marker of `agent_id`.
    #[must_use]
    pub fn marker(&self, agent_id: &AgentId) -> Option<DesiredStateMarker> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .map(|slot| *slot.marker())
    }

    fn slot(&self, agent_id: &AgentId) -> Arc<AgentSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(agent_id) {
            return Arc::clone(slot);
        }
        let (signal, rx) = DebounceSignal::new();
        let slot = Arc::new(AgentSlot {
            signal,
            marker: Mutex::new(DesiredStateMarker::default()),
        });
        slots.insert(agent_id.clone(), Arc::clone(&slot));
        let _ = self
            .new_workers
            .send((agent_id.clone(), Arc::clone(&slot), rx));
        slot
    }

    fn is_current_slot(&self, agent_id: &AgentId, slot: &Arc<AgentSlot>) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Run the reconciler until `stop` fires.
    ///
    /// Spawns one debounced worker per agent and re-evaluates an agent
    /// whenever a new session opens for it.
    #[tracing::instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut stop: StopReceiver) {
        let Some(mut new_workers) = self
            .new_workers_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            tracing::error!("State reconciler is already running");
            return;
        };
        let mut lifecycle = self.hub.subscribe(&[Topic::Lifecycle]);
        let mut workers = JoinSet::new();
        let mut handles: HashMap<AgentId, AbortHandle> = HashMap::new();
        tracing::info!("Starting state reconciler");

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                Some((agent_id, slot, rx)) = new_workers.recv() => {
                    // Retired before its worker got spawned.
                    if !self.is_current_slot(&agent_id, &slot) {
                        continue;
                    }
                    let this = Arc::clone(&self);
                    let stop = stop.resubscribe();
                    let key = agent_id.clone();
                    let handle = workers.spawn(async move { this.run_agent(agent_id, slot, rx, stop).await });
                    handles.insert(key, handle);
                }
                Some(notification) = lifecycle.recv() => {
                    let agent_id = notification.agent_id;
                    match notification.event {
                        AgentEvent::SessionOpened => {
                            self.connected
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(agent_id.clone(), notification.session_id);
                            self.slot(&agent_id).marker().pushed = None;
                            self.request_push(&agent_id);
                        }
                        AgentEvent::SessionClosed(_) => {
                            let current = {
                                let mut connected = self.connected.lock().unwrap_or_else(PoisonError::into_inner);
                                let current = connected
                                    .get(&agent_id)
                                    .is_none_or(|session_id| *session_id == notification.session_id);
                                if current {
                                    connected.remove(&agent_id);
                                }
                                current
                            };
                            if current {
                                self.slots
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .remove(&agent_id);
                                if let Some(worker) = handles.remove(&agent_id) {
                                    worker.abort();
                                    tracing::debug!(%agent_id, "Retired state push worker");
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => match joined {
                    Err(err) if !err.is_cancelled() => {
                        tracing::error!(error = %err, "State push worker failed");
                    }
                    _ => {}
                },
            }
        }

        workers.shutdown().await;
        tracing::info!("State reconciler stopped");
    }

    async fn run_agent(
        &self,
        agent_id: AgentId,
        slot: Arc<AgentSlot>,
        rx: mpsc::Receiver<()>,
        stop: StopReceiver,
    ) {
        let agent_id = &agent_id;
        let slot = &slot;
        run_debounced(
            rx,
            slot.signal.clone(),
            self.config.batch_delay(),
            stop,
            move || self.push(agent_id, slot),
        )
        .await;
    }

    async fn push(&self, agent_id: &AgentId, slot: &AgentSlot) -> Flush {
        let version = {
            let marker = slot.marker();
            if marker.is_current() {
                tracing::debug!(%agent_id, version = marker.desired, "Desired state already delivered");
                return Flush::Done;
            }
            marker.desired
        };

        if !self.dispatch.is_connected(agent_id) {
            tracing::debug!(%agent_id, "Agent is not connected, state will be pushed on reconnect");
            return Flush::Done;
        }

        let mut state = match self.source.desired_state(agent_id).await {
            Ok(state) => state,
            Err(StateSourceError::UnknownAgent(_)) => {
                tracing::warn!(%agent_id, "Agent has no desired state, skipping push");
                return Flush::Done;
            }
            Err(err) => {
                tracing::error!(%agent_id, error = %err, "Failed to compute desired state");
                return Flush::Retry;
            }
        };
        state.version = version;

        match self
            .dispatch
            .dispatch(agent_id, RequestPayload::SetState(state), self.config.push_timeout())
            .await
        {
            Ok(_) => {
                let mut marker = slot.marker();
                marker.pushed = Some(marker.pushed.map_or(version, |pushed| pushed.max(version)));
                tracing::info!(%agent_id, version, "Desired state pushed");
                Flush::Done
            }
            Err(DispatchError::NotConnected(_)) => {
                tracing::debug!(%agent_id, "Agent disconnected before push, dropping");
                Flush::Done
            }
            Err(err) => {
                tracing::warn!(%agent_id, error = %err, "Failed to push desired state, will retry");
                Flush::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use fleet_core::{
        ResponsePayload,
        config::DispatchConfig,
        message::{ProcessSpec, SetStateRequest},
    };
    use fleet_session::{RequestDispatcher, testing::{self, TestFleet}};
    use tokio::sync::broadcast;

    use super::*;

    struct StaticSource;

    #[async_trait]
    impl DesiredStateSource for StaticSource {
        async fn desired_state(&self, agent_id: &AgentId) -> Result<SetStateRequest, StateSourceError> {
            let mut state = SetStateRequest::default();
            state.processes.insert(
                format!("node_exporter-{agent_id}"),
                ProcessSpec {
                    kind: "node_exporter".to_string(),
                    ..ProcessSpec::default()
                },
            );
            Ok(state)
        }
    }

    /// Dispatch that fails the first `failures` calls with a connection error.
    struct FlakyDispatch {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl Dispatch for FlakyDispatch {
        async fn dispatch(
            &self,
            _agent_id: &AgentId,
            _payload: RequestPayload,
            _timeout: Duration,
        ) -> Result<ResponsePayload, DispatchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(DispatchError::ConnectionError("reset".to_string()))
            } else {
                Ok(ResponsePayload::SetState)
            }
        }

        fn is_connected(&self, _agent_id: &AgentId) -> bool {
            true
        }
    }

    fn spawn_reconciler(
        dispatch: Arc<dyn Dispatch>,
        hub: Arc<NotificationHub>,
    ) -> (Arc<StateReconciler>, broadcast::Sender<()>) {
        let reconciler = StateReconciler::new(dispatch, Arc::new(StaticSource), hub, ReconcilerConfig::default());
        let (stop, stop_rx) = broadcast::channel(1);
        tokio::spawn(Arc::clone(&reconciler).run(stop_rx));
        (reconciler, stop)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_push_requests_result_in_one_push() {
        let fleet = TestFleet::new();
        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&fleet.registry),
            &DispatchConfig::default(),
        ));
        let (reconciler, _stop) = spawn_reconciler(dispatcher, Arc::clone(&fleet.hub));
        tokio::task::yield_now().await;

        let (_session, mut agent) = testing::connect(&fleet.registry, "a1").await;
        let agent_id = AgentId::new("a1");
        for _ in 0..20 {
            reconciler.request_push(&agent_id);
        }

        let (id, payload) = agent.next_request().await;
        let RequestPayload::SetState(state) = payload else {
            panic!("expected set_state, got {payload:?}");
        };
        assert!(state.processes.contains_key("node_exporter-a1"));
        agent.respond(id, ResponsePayload::SetState);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let marker = reconciler.marker(&agent_id).unwrap();
        assert!(marker.is_current());
        assert_eq!(marker.pushed, Some(state.version));

        // No second set_state: only keepalive pings follow.
        let extra = tokio::time::timeout(Duration::from_secs(5), agent.next_request()).await;
        assert!(extra.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_push_is_retried() {
        let hub = Arc::new(NotificationHub::new());
        let dispatch = Arc::new(FlakyDispatch {
            calls: AtomicUsize::new(0),
            failures: 2,
        });
        let (reconciler, _stop) = spawn_reconciler(dispatch.clone(), hub);

        let agent_id = AgentId::new("a1");
        reconciler.request_push(&agent_id);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 3);
        assert!(reconciler.marker(&agent_id).unwrap().is_current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_for_disconnected_agent_is_dropped() {
        let fleet = TestFleet::new();
        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&fleet.registry),
            &DispatchConfig::default(),
        ));
        let (reconciler, _stop) = spawn_reconciler(dispatcher, Arc::clone(&fleet.hub));

        let agent_id = AgentId::new("offline");
        reconciler.request_push(&agent_id);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(reconciler.marker(&agent_id), None);

        // Connecting re-evaluates and delivers the pending state.
        let (_session, mut agent) = testing::connect(&fleet.registry, "offline").await;
        let (id, payload) = agent.next_request().await;
        assert!(matches!(payload, RequestPayload::SetState(_)));
        agent.respond(id, ResponsePayload::SetState);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(reconciler.marker(&agent_id).unwrap().is_current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_all_targets_connected_agents() {
        let fleet = TestFleet::new();
        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&fleet.registry),
            &DispatchConfig::default(),
        ));
        let (reconciler, _stop) = spawn_reconciler(dispatcher, Arc::clone(&fleet.hub));
        tokio::task::yield_now().await;

        let (_s1, a1) = testing::connect(&fleet.registry, "a1").await;
        let (_s2, a2) = testing::connect(&fleet.registry, "a2").await;
        let _serve1 = a1.serve_ok();
        let _serve2 = a2.serve_ok();
        tokio::time::sleep(Duration::from_secs(5)).await;

        reconciler.update_all();
        for agent in ["a1", "a2"] {
            let marker = reconciler.marker(&AgentId::new(agent)).unwrap();
            assert_eq!(marker.desired, 2);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        for agent in ["a1", "a2"] {
            assert!(reconciler.marker(&AgentId::new(agent)).unwrap().is_current());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_retires_worker() {
        let fleet = TestFleet::new();
        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&fleet.registry),
            &DispatchConfig::default(),
        ));
        let (reconciler, _stop) = spawn_reconciler(dispatcher, Arc::clone(&fleet.hub));
        tokio::task::yield_now().await;

        let agent_id = AgentId::new("a1");
        let (session, agent) = testing::connect(&fleet.registry, "a1").await;
        let _serve = agent.serve_ok();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(reconciler.marker(&agent_id).unwrap().is_current());
        let slot = Arc::clone(reconciler.slots.lock().unwrap().get(&agent_id).unwrap());

        fleet.registry.forget(&agent_id);
        session.closed().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(reconciler.marker(&agent_id), None);
        assert_eq!(Arc::strong_count(&slot), 1, "worker still holds the slot");

        // A new session gets a fresh worker and push.
        let (_session, mut agent) = testing::connect(&fleet.registry, "a1").await;
        let (id, payload) = agent.next_request().await;
        assert!(matches!(payload, RequestPayload::SetState(_)));
        agent.respond(id, ResponsePayload::SetState);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(reconciler.marker(&agent_id).unwrap().is_current());
    }
}
