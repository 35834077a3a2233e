//! Component wiring for one controller replica.

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use axum::Router;
use fleet_core::{
    AgentId, DesiredStateSource, Dispatch, NotificationHub,
    config::ControllerConfig,
    message::{SetStateRequest, Welcome},
    traits::AcceptAll,
};
use fleet_services::{
    ActionService, ClusterMembership, ForwardingLayer, InMemoryDirectory, JobService,
    StateReconciler, StaticMembership,
};
use fleet_session::{MemoryJobStore, RegistryCollector, RequestDispatcher, SessionRegistry};
use fleet_transport::{
    forward::{HttpReplicaClient, forward_router},
    websocket::agent_router,
};
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinSet};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{api, inventory::Inventory};

/// Contents of the file named by `FLEET_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ControllerFile {
    #[serde(flatten)]
    pub controller: ControllerConfig,
    /// Initial desired state per agent.
    pub desired_state: HashMap<AgentId, SetStateRequest>,
}

impl ControllerFile {
    /// Load from `path`, or defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
    }
}

pub struct Controller {
    pub config: ControllerConfig,
    pub registry: Arc<SessionRegistry>,
    pub forwarding: Arc<ForwardingLayer>,
    pub reconciler: Arc<StateReconciler>,
    pub actions: Arc<ActionService>,
    pub jobs: Arc<JobService>,
    pub inventory: Arc<Inventory>,
    pub metrics: prometheus::Registry,
}

impl Controller {
    /// Build every component. Nothing runs until [`Controller::spawn`].
    ///
    /// # Errors
    ///
    /// Returns an error if metrics cannot be registered.
    pub fn new(file: ControllerFile) -> anyhow::Result<Arc<Self>> {
        let ControllerFile {
            controller: config,
            desired_state,
        } = file;
        let hub = Arc::new(NotificationHub::new());
        let registry = SessionRegistry::new(
            config.session.clone(),
            Arc::clone(&hub),
            Arc::new(AcceptAll),
            Welcome {
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                replica_id: config.forwarding.replica_id.clone(),
            },
        )
        .context("creating session registry")?;

        let metrics = prometheus::Registry::new();
        RegistryCollector(Arc::clone(&registry))
            .register(&metrics)
            .context("registering session metrics")?;

        let local: Arc<dyn Dispatch> =
            Arc::new(RequestDispatcher::new(Arc::clone(&registry), &config.dispatch));

        let forwarding = ForwardingLayer::new(
            Arc::clone(&local),
            Arc::new(InMemoryDirectory::new()),
            Arc::new(membership(&config)),
            Arc::new(HttpReplicaClient::new()),
            Arc::clone(&hub),
            config.forwarding.clone(),
        );

        let inventory = Arc::new(Inventory::new(desired_state));
        // Agent notifications reach the replica owning the stream, so the
        // services dispatch only to local sessions.
        let reconciler = StateReconciler::new(
            Arc::clone(&local),
            Arc::clone(&inventory) as Arc<dyn DesiredStateSource>,
            Arc::clone(&hub),
            config.reconciler.clone(),
        );
        let actions = ActionService::new(Arc::clone(&local), Arc::clone(&hub), config.actions.clone());
        let jobs = JobService::new(
            local,
            Arc::new(MemoryJobStore::new()),
            Arc::clone(&hub),
            config.jobs.clone(),
        );

        Ok(Arc::new(Self {
            config,
            registry,
            forwarding,
            reconciler,
            actions,
            jobs,
            inventory,
            metrics,
        }))
    }

    /// HTTP surface: agent WebSocket, forwarding endpoint, ops API, metrics.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .merge(agent_router(Arc::clone(&self.registry)))
            .merge(forward_router(Arc::clone(&self.forwarding)))
            .merge(api::router(Arc::clone(self)))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Start the background loops; each ends when `stop` fires.
    pub fn spawn(&self, stop: &broadcast::Sender<()>) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(&self.reconciler).run(stop.subscribe()));
        tasks.spawn(Arc::clone(&self.actions).run(stop.subscribe()));
        tasks.spawn(Arc::clone(&self.jobs).run(stop.subscribe()));
        tasks.spawn(Arc::clone(&self.forwarding).run(stop.subscribe()));
        tasks
    }

    /// Drain every session, then close whatever is left.
    pub async fn shutdown(&self) {
        tracing::info!(sessions = self.registry.len(), "Draining agent sessions");
        self.registry
            .drain_all(self.config.session.drain_grace())
            .await;
        self.registry.kick_all();
    }
}

/// Static membership from config; the lowest replica id leads.
fn membership(config: &ControllerConfig) -> StaticMembership {
    let forwarding = &config.forwarding;
    let leader = forwarding
        .peers
        .keys()
        .all(|peer| forwarding.replica_id.as_str() <= peer.as_str());
    let mut membership = StaticMembership::new(forwarding.replica_id.clone(), leader);
    for (replica, address) in &forwarding.peers {
        membership = membership.with_peer(replica.clone(), address.clone());
    }
    tracing::info!(
        replica_id = %membership.self_id(),
        leader = membership.is_leader(),
        peers = forwarding.peers.len(),
        "Cluster membership"
    );
    membership
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_file_config_overrides_and_desired_state() {
        let file: ControllerFile = serde_json::from_str(
            r#"{
                "listen_addr": "0.0.0.0:9000",
                "jobs": {"max_retries": 7},
                "desired_state": {"a1": {"version": 0, "processes": {}}}
            }"#,
        )
        .unwrap();
        assert_eq!(file.controller.listen_addr.port(), 9000);
        assert_eq!(file.controller.jobs.max_retries, 7);
        assert_eq!(file.controller.session.outbound_capacity, 32);
        assert!(file.desired_state.contains_key(&AgentId::new("a1")));
    }

    #[test]
    fn test_lowest_replica_id_leads() {
        let mut config = ControllerConfig::default();
        config.forwarding.replica_id = "r2".to_string();
        config.forwarding.peers =
            BTreeMap::from([("r1".to_string(), "http://r1".to_string())]);
        let replica = membership(&config);
        assert!(!replica.is_leader());
        assert_eq!(replica.replica_address(&"r1".to_string()).as_deref(), Some("http://r1"));

        config.forwarding.replica_id = "r0".to_string();
        assert!(membership(&config).is_leader());
    }

    #[tokio::test]
    async fn test_spawned_loops_stop() {
        let controller = Controller::new(ControllerFile::default()).unwrap();
        let (stop, _) = broadcast::channel(1);
        let mut tasks = controller.spawn(&stop);
        stop.send(()).unwrap();
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }
}
