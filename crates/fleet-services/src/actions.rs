//! Short-lived diagnostic actions run by agents.
//!
//! Starting an action only waits for the agent to accept it. Output arrives
//! later as `action_result` notifications, possibly in several chunks, and is
//! kept until fetched or until it expires.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use fleet_core::{
    ActionId, AgentEvent, AgentId, CloseReason, Dispatch, DispatchError, Notification,
    NotificationHub, RequestPayload, SessionId, Topic,
    config::ActionConfig,
    message::{ActionResult, StartActionRequest},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::StopReceiver;

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Action type understood by the agent, e.g. `pt-summary` or `explain`.
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    /// Overrides the configured default action timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Action error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("Action not found: {0}")]
    NotFound(ActionId),
    #[error("Result of action {0} is not yet available")]
    NotYetAvailable(ActionId),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Snapshot of an action's accumulated output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResultView {
    pub action_id: ActionId,
    pub agent_id: AgentId,
    pub output: String,
    pub error: Option<String>,
    pub done: bool,
}

struct ActionState {
    agent_id: AgentId,
    // Session current for the agent when the action started, if known.
    owner: Option<SessionId>,
    output: String,
    error: Option<String>,
    done: bool,
    timeout: Duration,
    deadline: Instant,
    updated: Instant,
}

impl ActionState {
    fn view(&self, action_id: ActionId) -> ActionResultView {
        ActionResultView {
            action_id,
            agent_id: self.agent_id.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            done: self.done,
        }
    }

    fn fail(&mut self, error: String) {
        self.error = Some(error);
        self.done = true;
        self.updated = Instant::now();
    }
}

/// Starts actions and collects their results.
pub struct ActionService {
    dispatch: Arc<dyn Dispatch>,
    hub: Arc<NotificationHub>,
    config: ActionConfig,
    actions: Mutex<HashMap<ActionId, ActionState>>,
    sessions: Mutex<HashMap<AgentId, SessionId>>,
}

impl ActionService {
    #[must_use]
    pub fn new(dispatch: Arc<dyn Dispatch>, hub: Arc<NotificationHub>, config: ActionConfig) -> Arc<Self> {
        Arc::new(Self {
            dispatch,
            hub,
            config,
            actions: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn actions(&self) -> MutexGuard<'_, HashMap<ActionId, ActionState>> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<AgentId, SessionId>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask `agent_id` to start an action. Returns once the agent accepted it.
    ///
    /// # Errors
    ///
    /// Returns the dispatch error if the agent could not be reached or refused.
    #[tracing::instrument(skip(self, spec), fields(kind = %spec.kind))]
    pub async fn start(&self, agent_id: &AgentId, spec: ActionSpec) -> Result<ActionId, ActionError> {
        let action_id = Uuid::new_v4();
        let timeout = spec
            .timeout_ms
            .map_or_else(|| self.config.default_timeout(), Duration::from_millis);
        let now = Instant::now();

        // Registered first: the result may arrive before the dispatch returns.
        let owner = self.sessions().get(agent_id).copied();
        self.actions().insert(
            action_id,
            ActionState {
                agent_id: agent_id.clone(),
                owner,
                output: String::new(),
                error: None,
                done: false,
                timeout,
                deadline: now + timeout,
                updated: now,
            },
        );

        let request = RequestPayload::StartAction(StartActionRequest {
            action_id,
            kind: spec.kind,
            params: spec.params,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        });
        if let Err(err) = self
            .dispatch
            .dispatch(agent_id, request, self.config.default_timeout())
            .await
        {
            self.actions().remove(&action_id);
            tracing::warn!(%action_id, error = %err, "Failed to start action");
            return Err(err.into());
        }

        tracing::info!(%action_id, "Action started");
        Ok(action_id)
    }

    /// Fetch an action's result.
    ///
    /// A finished result is handed out once and then forgotten.
    ///
    /// # Errors
    ///
    /// `NotYetAvailable` while the agent has not finished, `NotFound` for an
    /// unknown, already fetched, or expired action.
    pub fn get_result(&self, action_id: ActionId) -> Result<ActionResultView, ActionError> {
        let mut actions = self.actions();
        match actions.get(&action_id) {
            None => Err(ActionError::NotFound(action_id)),
            Some(state) if !state.done => Err(ActionError::NotYetAvailable(action_id)),
            Some(state) => {
                let view = state.view(action_id);
                actions.remove(&action_id);
                Ok(view)
            }
        }
    }

    /// Output received so far, finished or not.
    #[must_use]
    pub fn peek(&self, action_id: ActionId) -> Option<ActionResultView> {
        self.actions().get(&action_id).map(|state| state.view(action_id))
    }

    /// Best-effort cancellation.
    ///
    /// # Errors
    ///
    /// Returns the dispatch error if the agent could not be reached or refused.
    pub async fn stop(&self, agent_id: &AgentId, action_id: ActionId) -> Result<(), ActionError> {
        self.dispatch
            .dispatch(
                agent_id,
                RequestPayload::StopAction { action_id },
                self.config.default_timeout(),
            )
            .await?;
        tracing::info!(%agent_id, %action_id, "Action stop requested");
        Ok(())
    }

    /// Consume action results and session events until `stop` fires.
    #[tracing::instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut stop: StopReceiver) {
        let mut events = self.hub.subscribe(&[Topic::Actions, Topic::Lifecycle]);
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                Some(notification) = events.recv() => self.handle(notification),
                _ = sweep.tick() => self.sweep(),
            }
        }
        tracing::debug!("Action service stopped");
    }

    fn handle(&self, notification: Notification) {
        let Notification {
            agent_id,
            session_id,
            event,
        } = notification;
        match event {
            AgentEvent::ActionResult(result) => self.record(&agent_id, result),
            AgentEvent::SessionOpened => {
                self.sessions().insert(agent_id, session_id);
            }
            AgentEvent::SessionClosed(reason) => self.session_closed(&agent_id, session_id, &reason),
            _ => {}
        }
    }

    fn record(&self, agent_id: &AgentId, result: ActionResult) {
        let mut actions = self.actions();
        let Some(state) = actions.get_mut(&result.action_id) else {
            tracing::debug!(%agent_id, action_id = %result.action_id, "Result for unknown action");
            return;
        };
        if state.done {
            tracing::debug!(action_id = %result.action_id, "Ignoring result after final chunk");
            return;
        }
        state.output.push_str(&result.output);
        if result.error.is_some() {
            state.error = result.error;
        }
        state.done = result.done;
        state.updated = Instant::now();
        if state.done {
            tracing::info!(%agent_id, action_id = %result.action_id, failed = state.error.is_some(), "Action finished");
        }
    }

    fn session_closed(&self, agent_id: &AgentId, session_id: SessionId, reason: &CloseReason) {
        {
            let mut sessions = self.sessions();
            if sessions.get(agent_id) == Some(&session_id) {
                sessions.remove(agent_id);
            }
        }

        let error = DispatchError::ConnectionError(reason.to_string()).to_string();
        let mut failed = 0;
        for state in self.actions().values_mut() {
            let owned = state.owner.is_none_or(|owner| owner == session_id);
            if !state.done && state.agent_id == *agent_id && owned {
                state.fail(error.clone());
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::warn!(%agent_id, %session_id, failed, "Session closed with actions in progress");
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.config.result_ttl();
        let mut actions = self.actions();
        for (action_id, state) in actions.iter_mut() {
            if !state.done && now >= state.deadline {
                tracing::warn!(%action_id, agent_id = %state.agent_id, "Action timed out");
                state.fail(DispatchError::Timeout(state.timeout).to_string());
            }
        }
        let before = actions.len();
        actions.retain(|_, state| !state.done || now.duration_since(state.updated) < ttl);
        let expired = before - actions.len();
        if expired > 0 {
            tracing::debug!(expired, "Expired action results");
        }
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::{AgentMessage, ResponsePayload, config::DispatchConfig};
    use fleet_session::{
        RequestDispatcher,
        testing::{self, FakeAgent, TestFleet},
    };
    use serde_json::json;
    use tokio::sync::broadcast;

    use super::*;

    struct Harness {
        fleet: TestFleet,
        service: Arc<ActionService>,
        _stop: broadcast::Sender<()>,
    }

    async fn harness(config: ActionConfig) -> Harness {
        let fleet = TestFleet::new();
        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&fleet.registry),
            &DispatchConfig::default(),
        ));
        let service = ActionService::new(dispatcher, Arc::clone(&fleet.hub), config);
        let (stop, stop_rx) = broadcast::channel(1);
        tokio::spawn(Arc::clone(&service).run(stop_rx));
        tokio::task::yield_now().await;
        Harness {
            fleet,
            service,
            _stop: stop,
        }
    }

    /// Start an action and accept it on the agent side.
    async fn start_accepted(service: &Arc<ActionService>, agent: &mut FakeAgent, agent_id: &str) -> ActionId {
        let start = {
            let service = Arc::clone(service);
            let agent_id = AgentId::new(agent_id);
            tokio::spawn(async move {
                service
                    .start(
                        &agent_id,
                        ActionSpec {
                            kind: "pt-mysql-summary".to_string(),
                            params: json!({"dsn": "root@tcp(127.0.0.1:3306)"}),
                            timeout_ms: None,
                        },
                    )
                    .await
            })
        };
        let (id, payload) = agent.next_request().await;
        assert!(matches!(payload, RequestPayload::StartAction(ref req) if req.timeout_ms == 10_000));
        agent.respond(id, ResponsePayload::StartAction);
        start.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_result_accumulates_until_done() {
        let h = harness(ActionConfig::default()).await;
        let (_session, mut agent) = testing::connect(&h.fleet.registry, "a1").await;
        let action_id = start_accepted(&h.service, &mut agent, "a1").await;

        assert_eq!(
            h.service.get_result(action_id),
            Err(ActionError::NotYetAvailable(action_id))
        );

        for (output, done) in [("part one, ", false), ("part two", true)] {
            agent.send(AgentMessage::ActionResult(ActionResult {
                action_id,
                output: output.to_string(),
                error: None,
                done,
            }));
        }
        while !h.service.peek(action_id).is_some_and(|v| v.done) {
            tokio::task::yield_now().await;
        }

        let result = h.service.get_result(action_id).unwrap();
        assert_eq!(result.output, "part one, part two");
        assert_eq!(result.error, None);
        assert_eq!(h.service.get_result(action_id), Err(ActionError::NotFound(action_id)));
    }

    #[tokio::test]
    async fn test_session_close_fails_pending_action() {
        let h = harness(ActionConfig::default()).await;
        let (session, mut agent) = testing::connect(&h.fleet.registry, "a1").await;
        let action_id = start_accepted(&h.service, &mut agent, "a1").await;

        session.close(CloseReason::Kicked);
        while !h.service.peek(action_id).is_some_and(|v| v.done) {
            tokio::task::yield_now().await;
        }

        let result = h.service.get_result(action_id).unwrap();
        assert!(result.error.unwrap().contains("connection to agent lost"));
    }

    #[tokio::test]
    async fn test_start_on_disconnected_agent_fails() {
        let h = harness(ActionConfig::default()).await;
        let err = h
            .service
            .start(&AgentId::new("nobody"), ActionSpec::default())
            .await
            .unwrap_err();
        assert_eq!(err, ActionError::Dispatch(DispatchError::NotConnected(AgentId::new("nobody"))));
    }

    #[tokio::test]
    async fn test_stop_sends_stop_action() {
        let h = harness(ActionConfig::default()).await;
        let (_session, mut agent) = testing::connect(&h.fleet.registry, "a1").await;
        let action_id = start_accepted(&h.service, &mut agent, "a1").await;
        let _serve = agent.serve(move |payload| match payload {
            RequestPayload::StopAction { action_id: id } if *id == action_id => Ok(ResponsePayload::StopAction),
            other => Err(format!("unexpected {other:?}")),
        });

        h.service.stop(&AgentId::new("a1"), action_id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfinished_action_times_out_then_expires() {
        let h = harness(ActionConfig {
            result_ttl_ms: 60_000,
            sweep_interval_ms: 1_000,
            ..ActionConfig::default()
        })
        .await;
        let (_session, mut agent) = testing::connect(&h.fleet.registry, "a1").await;
        let action_id = start_accepted(&h.service, &mut agent, "a1").await;
        let _serve = agent.serve_ok();

        tokio::time::sleep(Duration::from_secs(12)).await;
        let view = h.service.peek(action_id).unwrap();
        assert!(view.done);
        assert_eq!(
            view.error,
            Some(DispatchError::Timeout(Duration::from_secs(10)).to_string())
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.service.peek(action_id).is_none());
    }
}
