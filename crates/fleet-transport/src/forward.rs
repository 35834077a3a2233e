//! Replica-to-replica forwarding over HTTP.
//!
//! The owning replica serves `POST /internal/v1/forward` with a JSON
//! [`ForwardRequest`] body and answers with a [`ForwardResponse`]; dispatch
//! errors travel inside the response body, so any non-2xx status means the
//! endpoint itself failed.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{Json, Router, extract::State, routing::post};
use fleet_services::{ForwardRequest, ForwardResponse, ForwardingLayer, ReplicaClient, ReplicaError};

/// Path of the internal forwarding endpoint.
pub const FORWARD_PATH: &str = "/internal/v1/forward";

async fn forward_handler(
    State(layer): State<Arc<ForwardingLayer>>,
    Json(request): Json<ForwardRequest>,
) -> Json<ForwardResponse> {
    Json(layer.serve(request).await)
}

/// Router exposing [`FORWARD_PATH`].
#[must_use]
pub fn forward_router(layer: Arc<ForwardingLayer>) -> Router {
    Router::new()
        .route(FORWARD_PATH, post(forward_handler))
        .with_state(layer)
}

/// [`ReplicaClient`] speaking to peers' forwarding endpoints.
#[derive(Debug, Clone, Default)]
pub struct HttpReplicaClient {
    client: reqwest::Client,
}

impl HttpReplicaClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReplicaClient for HttpReplicaClient {
    async fn forward(
        &self,
        address: &str,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResponse, ReplicaError> {
        let url = format!("{}{FORWARD_PATH}", address.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ReplicaError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReplicaError::Protocol(format!("{url} answered {status}")));
        }
        response
            .json::<ForwardResponse>()
            .await
            .map_err(|e| ReplicaError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use fleet_core::{
        AgentId, DispatchError, RequestPayload, ResponsePayload,
        config::{DispatchConfig, ForwardingConfig},
    };
    use fleet_services::{ClusterDirectory, InMemoryDirectory, StaticMembership};
    use fleet_session::{
        RequestDispatcher,
        testing::{self, TestFleet},
    };
    use tower::ServiceExt;

    use super::*;

    fn owner(fleet: &TestFleet) -> Arc<ForwardingLayer> {
        ForwardingLayer::new(
            Arc::new(RequestDispatcher::new(
                Arc::clone(&fleet.registry),
                &DispatchConfig::default(),
            )),
            Arc::new(InMemoryDirectory::new()),
            Arc::new(StaticMembership::new("r2", false)),
            Arc::new(HttpReplicaClient::new()),
            Arc::clone(&fleet.hub),
            ForwardingConfig {
                enabled: true,
                replica_id: "r2".to_string(),
                ..ForwardingConfig::default()
            },
        )
    }

    fn forward_request(agent_id: &str, payload: RequestPayload) -> ForwardRequest {
        ForwardRequest {
            target_agent_id: AgentId::new(agent_id),
            protocol_version: 1,
            hops: 1,
            timeout_ms: 2_000,
            payload,
        }
    }

    async fn post_forward(app: Router, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(
                Request::post(FORWARD_PATH)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_endpoint_relays_to_local_session() {
        let fleet = TestFleet::new();
        let (_session, agent) = testing::connect(&fleet.registry, "a1").await;
        let _serve = agent.serve_ok();
        let app = forward_router(owner(&fleet));

        let body = serde_json::to_vec(&forward_request("a1", RequestPayload::Ping)).unwrap();
        let (status, body) = post_forward(app, body).await;

        assert_eq!(status, StatusCode::OK);
        let response: ForwardResponse = serde_json::from_slice(&body).unwrap();
        assert!(matches!(
            response,
            ForwardResponse::Ok {
                payload: ResponsePayload::Pong { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_endpoint_reports_dispatch_errors_in_body() {
        let fleet = TestFleet::new();
        let app = forward_router(owner(&fleet));

        let body = serde_json::to_vec(&forward_request("gone", RequestPayload::Ping)).unwrap();
        let (status, body) = post_forward(app, body).await;

        assert_eq!(status, StatusCode::OK);
        let response: ForwardResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            response.into_result(&AgentId::new("gone"), Duration::from_secs(2)),
            Err(DispatchError::NotConnected(AgentId::new("gone")))
        );
    }

    #[tokio::test]
    async fn test_endpoint_rejects_malformed_body() {
        let fleet = TestFleet::new();
        let app = forward_router(owner(&fleet));

        let (status, _) = post_forward(app, b"{\"hops\":1}".to_vec()).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_client_round_trip_over_http() {
        let fleet = TestFleet::new();
        let (_session, agent) = testing::connect(&fleet.registry, "a1").await;
        let _serve = agent.serve_ok();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(axum::serve(listener, forward_router(owner(&fleet))).into_future());

        let client = HttpReplicaClient::new();
        let response = client
            .forward(
                &address,
                forward_request("a1", RequestPayload::StopJob {
                    job_id: uuid::Uuid::nil(),
                }),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            ForwardResponse::Ok {
                payload: ResponsePayload::StopJob
            }
        );
        server.abort();
    }

    #[tokio::test]
    async fn test_client_reports_unreachable_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = HttpReplicaClient::new()
            .forward(
                &address,
                forward_request("a1", RequestPayload::Ping),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_layers_forward_across_http() {
        let owner_fleet = TestFleet::new();
        let (_session, agent) = testing::connect(&owner_fleet.registry, "a1").await;
        let _serve = agent.serve_ok();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let server =
            tokio::spawn(axum::serve(listener, forward_router(owner(&owner_fleet))).into_future());

        let directory = Arc::new(InMemoryDirectory::new());
        directory.set_owner(&AgentId::new("a1"), &"r2".to_string()).await;
        let caller_fleet = TestFleet::new();
        let caller = ForwardingLayer::new(
            Arc::new(RequestDispatcher::new(
                Arc::clone(&caller_fleet.registry),
                &DispatchConfig::default(),
            )),
            directory,
            Arc::new(StaticMembership::new("r1", true).with_peer("r2", address)),
            Arc::new(HttpReplicaClient::new()),
            Arc::clone(&caller_fleet.hub),
            ForwardingConfig {
                enabled: true,
                replica_id: "r1".to_string(),
                ..ForwardingConfig::default()
            },
        );

        let response = caller
            .route(&AgentId::new("a1"), RequestPayload::Ping, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(response, ResponsePayload::Pong { .. }));
        server.abort();
    }
}
