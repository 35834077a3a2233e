//! Prometheus collector for agent connection state.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `fleet_agents_connected` | Gauge | |
//! | `fleet_agents_agent_connected` | Gauge (1/0) | `agent_id` |
//! | `fleet_agents_connects_total` | Counter | |
//! | `fleet_agents_disconnects_total` | Counter | `reason` |
//! | `fleet_agents_messages_sent` | Gauge | `agent_id` |
//! | `fleet_agents_messages_received` | Gauge | `agent_id` |
//! | `fleet_agents_pending_requests` | Gauge | `agent_id` |
//! | `fleet_agents_outbound_queue_length` | Gauge | `agent_id` |
//! | `fleet_agents_round_trip_seconds` | Histogram | |
//! | `fleet_agents_clock_drift_seconds` | Histogram | |
//!
//! The per-session gauges are refreshed from live sessions on every scrape.

use std::{sync::Arc, time::Duration};

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    core::{Collector, Desc},
    proto::MetricFamily,
};
use thiserror::Error;

use crate::SessionRegistry;

const NAMESPACE: &str = "fleet";
const SUBSYSTEM: &str = "agents";

/// Errors that can occur during metrics setup.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to create metric: {0}")]
    Prometheus(#[from] prometheus::Error),
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM)
}

#[derive(Clone)]
pub(crate) struct RegistryMetrics {
    pub(crate) connected: IntGauge,
    pub(crate) agent_connected: IntGaugeVec,
    pub(crate) connects: IntCounter,
    pub(crate) disconnects: IntCounterVec,
    messages_sent: IntGaugeVec,
    messages_received: IntGaugeVec,
    pending_requests: IntGaugeVec,
    outbound_queue_length: IntGaugeVec,
    round_trip: Histogram,
    clock_drift: Histogram,
}

impl RegistryMetrics {
    pub(crate) fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            connected: IntGauge::with_opts(opts("connected", "Number of connected agents"))?,
            agent_connected: IntGaugeVec::new(
                opts("agent_connected", "The current connection status (1 connected, 0 disconnected)"),
                &["agent_id"],
            )?,
            connects: IntCounter::with_opts(opts(
                "connects_total",
                "Total number of accepted agent connections",
            ))?,
            disconnects: IntCounterVec::new(
                opts("disconnects_total", "Total number of agent disconnects"),
                &["reason"],
            )?,
            messages_sent: IntGaugeVec::new(
                opts("messages_sent", "Messages sent to the agent by the current session"),
                &["agent_id"],
            )?,
            messages_received: IntGaugeVec::new(
                opts("messages_received", "Messages received from the agent by the current session"),
                &["agent_id"],
            )?,
            pending_requests: IntGaugeVec::new(
                opts("pending_requests", "Requests awaiting an agent response"),
                &["agent_id"],
            )?,
            outbound_queue_length: IntGaugeVec::new(
                opts("outbound_queue_length", "Messages waiting in the session outbound queue"),
                &["agent_id"],
            )?,
            round_trip: Histogram::with_opts(HistogramOpts::from(opts(
                "round_trip_seconds",
                "Ping round-trip time",
            )))?,
            clock_drift: Histogram::with_opts(HistogramOpts::from(opts(
                "clock_drift_seconds",
                "Estimated absolute clock drift between agent and controller",
            )))?,
        })
    }

    pub(crate) fn observe_ping(&self, round_trip: Duration, clock_drift: Duration) {
        self.round_trip.observe(round_trip.as_secs_f64());
        self.clock_drift.observe(clock_drift.as_secs_f64());
    }

    fn collectors(&self) -> [&dyn Collector; 10] {
        [
            &self.connected,
            &self.agent_connected,
            &self.connects,
            &self.disconnects,
            &self.messages_sent,
            &self.messages_received,
            &self.pending_requests,
            &self.outbound_queue_length,
            &self.round_trip,
            &self.clock_drift,
        ]
    }

    /// Drop every per-agent series of `agent_id`.
    pub(crate) fn forget(&self, agent_id: &str) {
        for vec in [
            &self.agent_connected,
            &self.messages_sent,
            &self.messages_received,
            &self.pending_requests,
            &self.outbound_queue_length,
        ] {
            let _ = vec.remove_label_values(&[agent_id]);
        }
    }
}

fn saturating_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

/// Exposes a [`SessionRegistry`] to a prometheus registry.
#[derive(Clone)]
pub struct RegistryCollector(pub Arc<SessionRegistry>);

impl RegistryCollector {
    /// Register the collector with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric with the same name is already registered.
    pub fn register(&self, registry: &Registry) -> Result<(), MetricsError> {
        registry.register(Box::new(self.clone()))?;
        Ok(())
    }
}

impl Collector for RegistryCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.0
            .metrics()
            .collectors()
            .into_iter()
            .flat_map(|c| c.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let metrics = self.0.metrics();
        for vec in [
            &metrics.messages_sent,
            &metrics.messages_received,
            &metrics.pending_requests,
            &metrics.outbound_queue_length,
        ] {
            vec.reset();
        }
        for session in self.0.sessions() {
            let agent_id = session.agent_id().as_str();
            let snapshot = session.metrics();
            metrics
                .messages_sent
                .with_label_values(&[agent_id])
                .set(saturating_i64(snapshot.sent));
            metrics
                .messages_received
                .with_label_values(&[agent_id])
                .set(saturating_i64(snapshot.received));
            metrics
                .pending_requests
                .with_label_values(&[agent_id])
                .set(saturating_i64(snapshot.pending));
            metrics
                .outbound_queue_length
                .with_label_values(&[agent_id])
                .set(saturating_i64(snapshot.queued));
        }
        metrics
            .collectors()
            .into_iter()
            .flat_map(|c| c.collect())
            .collect()
    }
}
