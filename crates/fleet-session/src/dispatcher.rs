//! Correlated request/response over agent sessions.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use fleet_core::{
    AgentId, Dispatch, DispatchError, RequestPayload, ResponsePayload, config::DispatchConfig,
};
use tokio::time::Instant;

use crate::{SessionRegistry, session::unix_millis};

/// Sends requests to locally connected agents.
///
/// Never retries; the caller decides based on
/// [`DispatchError::is_retryable`]. Dropping the returned future cancels the
/// request without affecting the session or other requests.
#[derive(Clone)]
pub struct RequestDispatcher {
    registry: Arc<SessionRegistry>,
    default_timeout: Duration,
}

impl RequestDispatcher {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: &DispatchConfig) -> Self {
        Self {
            registry,
            default_timeout: config.default_timeout(),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Send `payload` to `agent_id` and wait up to `timeout` for its response.
    ///
    /// # Errors
    ///
    /// - `NotConnected` if no session is registered for the agent
    /// - `Backpressure` if the session cannot take more requests
    /// - `Timeout` if no response arrived in time (the session stays open)
    /// - `ConnectionError` if the session closed while waiting
    /// - `Rejected` if the agent answered with an error
    #[tracing::instrument(skip(self, payload), fields(kind = payload.kind().as_str(), request_id))]
    pub async fn send(
        &self,
        agent_id: &AgentId,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<ResponsePayload, DispatchError> {
        let session = self
            .registry
            .lookup(agent_id)
            .ok_or_else(|| DispatchError::NotConnected(agent_id.clone()))?;
        let in_flight = session.request(payload, timeout)?;
        tracing::Span::current().record("request_id", in_flight.request_id());

        let result = in_flight.wait().await;
        if let Err(err) = &result {
            tracing::debug!(error = %err, "Request failed");
        }
        result
    }

    /// [`send`](Self::send) with the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_default(
        &self,
        agent_id: &AgentId,
        payload: RequestPayload,
    ) -> Result<ResponsePayload, DispatchError> {
        self.send(agent_id, payload, self.default_timeout).await
    }

    /// Measure a round trip to the agent and estimate its clock drift.
    ///
    /// Both are recorded in the registry metrics.
    ///
    /// # Errors
    ///
    /// Any dispatch error, or `Rejected` if the agent answered with something
    /// other than a pong.
    pub async fn ping(&self, agent_id: &AgentId) -> Result<Duration, DispatchError> {
        let started = Instant::now();
        let started_ms = unix_millis();
        match self.send_default(agent_id, RequestPayload::Ping).await? {
            ResponsePayload::Pong { current_time_ms } => {
                let rtt = started.elapsed();
                let drift = clock_drift(current_time_ms.saturating_sub(started_ms), rtt);
                tracing::debug!(%agent_id, ?rtt, ?drift, "Round-trip time and estimated clock drift");
                self.registry.metrics().observe_ping(rtt, drift);
                Ok(rtt)
            }
            other => Err(DispatchError::Rejected(format!(
                "unexpected {} response to ping",
                other.kind().as_str()
            ))),
        }
    }
}

/// Agent clock offset, assuming the pong was stamped halfway through the round trip.
#[allow(clippy::cast_precision_loss)]
fn clock_drift(agent_minus_start_ms: i64, rtt: Duration) -> Duration {
    let offset = agent_minus_start_ms as f64 / 1_000.0 - rtt.as_secs_f64() / 2.0;
    Duration::try_from_secs_f64(offset.abs()).unwrap_or(Duration::MAX)
}

#[async_trait]
impl Dispatch for RequestDispatcher {
    async fn dispatch(
        &self,
        agent_id: &AgentId,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<ResponsePayload, DispatchError> {
        self.send(agent_id, payload, timeout).await
    }

    fn is_connected(&self, agent_id: &AgentId) -> bool {
        self.registry.is_connected(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::{CloseReason, config::SessionConfig};
    use uuid::Uuid;

    use super::*;
    use crate::{
        SessionStatus,
        testing::{self, TestFleet},
    };

    fn dispatcher(fleet: &TestFleet) -> RequestDispatcher {
        RequestDispatcher::new(Arc::clone(&fleet.registry), &DispatchConfig::default())
    }

    #[tokio::test]
    async fn test_send_is_pending_until_response() {
        let fleet = TestFleet::new();
        let (_session, mut agent) = testing::connect(&fleet.registry, "a1").await;
        let dispatcher = dispatcher(&fleet);
        let agent_id = AgentId::new("a1");

        let mut call = tokio_test::task::spawn(dispatcher.send(
            &agent_id,
            RequestPayload::StopJob { job_id: Uuid::nil() },
            Duration::from_secs(5),
        ));
        tokio_test::assert_pending!(call.poll());

        let (request_id, _) = agent.next_request().await;
        tokio_test::assert_pending!(call.poll());
        agent.respond(request_id, ResponsePayload::StopJob);

        while !call.is_woken() {
            tokio::task::yield_now().await;
        }
        tokio_test::assert_ready_eq!(call.poll(), Ok(ResponsePayload::StopJob));
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let fleet = TestFleet::new();
        let (_session, agent) = testing::connect(&fleet.registry, "a1").await;
        let _serve = agent.serve_ok();

        let resp = dispatcher(&fleet)
            .send(
                &AgentId::new("a1"),
                RequestPayload::StopJob { job_id: Uuid::nil() },
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(resp, Ok(ResponsePayload::StopJob));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_connected() {
        let fleet = TestFleet::new();
        let err = dispatcher(&fleet)
            .send_default(&AgentId::new("nobody"), RequestPayload::Ping)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::NotConnected(AgentId::new("nobody")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_session_usable() {
        let fleet = TestFleet::with_config(SessionConfig {
            ping_interval_ms: 60_000,
            keepalive_timeout_ms: 600_000,
            ..SessionConfig::default()
        });
        let (session, mut agent) = testing::connect(&fleet.registry, "a1").await;
        let dispatcher = dispatcher(&fleet);
        let agent_id = AgentId::new("a1");

        let started = Instant::now();
        let err = dispatcher
            .send(&agent_id, RequestPayload::StopJob { job_id: Uuid::nil() }, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Timeout(Duration::from_secs(2)));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.pending_count(), 0);

        // The late response is discarded.
        let (late_id, _) = agent.next_request().await;
        agent.respond(late_id, ResponsePayload::StopJob);

        let next = {
            let dispatcher = dispatcher.clone();
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                dispatcher
                    .send(&agent_id, RequestPayload::StopJob { job_id: Uuid::nil() }, Duration::from_secs(5))
                    .await
            })
        };
        let (id, _) = agent.next_request().await;
        assert_ne!(id, late_id);
        agent.respond(id, ResponsePayload::StopJob);
        assert_eq!(next.await.unwrap(), Ok(ResponsePayload::StopJob));
        assert_eq!(session.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_cancel_does_not_affect_other_requests() {
        let fleet = TestFleet::new();
        let (session, mut agent) = testing::connect(&fleet.registry, "a1").await;
        let dispatcher = dispatcher(&fleet);

        let spawn_request = |job_id: Uuid| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .send(&AgentId::new("a1"), RequestPayload::StopJob { job_id }, Duration::from_secs(30))
                    .await
            })
        };
        let canceled = spawn_request(Uuid::new_v4());
        let (_, first) = agent.next_request().await;
        let kept = spawn_request(Uuid::nil());
        let (kept_id, second) = agent.next_request().await;
        assert_ne!(first, second);
        assert_eq!(session.pending_count(), 2);

        canceled.abort();
        assert!(canceled.await.unwrap_err().is_cancelled());
        assert_eq!(session.pending_count(), 1);

        agent.respond(kept_id, ResponsePayload::StopJob);
        assert_eq!(kept.await.unwrap(), Ok(ResponsePayload::StopJob));
        assert_eq!(session.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_session_close_fails_waiters_with_connection_error() {
        let fleet = TestFleet::new();
        let (session, mut agent) = testing::connect(&fleet.registry, "a1").await;
        let dispatcher = dispatcher(&fleet);

        let waiter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.send_default(&AgentId::new("a1"), RequestPayload::Ping).await })
        };
        let _ = agent.next_request_any().await;
        session.close(CloseReason::Kicked);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::ConnectionError(_)));
        assert!(err.is_retryable());
        assert!(!Dispatch::is_connected(&dispatcher, &AgentId::new("a1")));
    }

    #[tokio::test]
    async fn test_agent_error_is_rejected() {
        let fleet = TestFleet::new();
        let (_session, agent) = testing::connect(&fleet.registry, "a1").await;
        let _serve = agent.serve(|_| Err("unsupported".to_string()));

        let err = dispatcher(&fleet)
            .send_default(&AgentId::new("a1"), RequestPayload::StopAction { action_id: Uuid::nil() })
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Rejected("unsupported".to_string()));
    }

    #[test]
    fn test_clock_drift_is_absolute_and_centered() {
        assert_eq!(clock_drift(1_000, Duration::from_millis(200)), Duration::from_millis(900));
        assert_eq!(clock_drift(-1_000, Duration::from_millis(200)), Duration::from_millis(1_100));
        assert_eq!(clock_drift(50, Duration::from_millis(100)), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_ping_measures_round_trip() {
        let fleet = TestFleet::new();
        let (_session, agent) = testing::connect(&fleet.registry, "a1").await;
        let _serve = agent.serve_ok();

        let rtt = dispatcher(&fleet).ping(&AgentId::new("a1")).await.unwrap();
        assert!(rtt < Duration::from_secs(5));
    }
}
