//! Tunables for every layer, grouped per component.
//!
//! All structs deserialize with missing fields falling back to defaults, so a
//! config file only needs to name what it overrides.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};

/// Per-session stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time the agent has to send its `hello`.
    pub handshake_timeout_ms: u64,
    /// Capacity of the bounded outbound queue.
    pub outbound_capacity: usize,
    /// Maximum outstanding requests per session.
    pub max_in_flight: usize,
    /// Interval between controller keepalive pings.
    pub ping_interval_ms: u64,
    /// Silence after which the session is closed.
    pub keepalive_timeout_ms: u64,
    /// How long a draining session waits for in-flight requests.
    pub drain_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            outbound_capacity: 32,
            max_in_flight: 128,
            ping_interval_ms: 10_000,
            keepalive_timeout_ms: 30_000,
            drain_grace_ms: 3_000,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    #[must_use]
    pub const fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    #[must_use]
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Delay used to batch bursts of push requests.
    pub batch_delay_ms: u64,
    /// Timeout of one `SetState` dispatch.
    pub push_timeout_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: 1_000,
            push_timeout_ms: 5_000,
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub const fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    #[must_use]
    pub const fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub dispatch_timeout_ms: u64,
    /// Byte budget of each job's log history.
    pub log_history_bytes: usize,
    /// How long a finished job's logs stay readable.
    pub log_retention_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            dispatch_timeout_ms: 10_000,
            log_history_bytes: 1024 * 1024,
            log_retention_ms: 10 * 60 * 1000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl JobConfig {
    /// Delay before the given (zero-based) retry attempt.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    #[must_use]
    pub const fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    #[must_use]
    pub const fn log_retention(&self) -> Duration {
        Duration::from_millis(self.log_retention_ms)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    pub default_timeout_ms: u64,
    /// How long finished results are kept if nobody fetches them.
    pub result_ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            result_ttl_ms: 5 * 60 * 1000,
            sweep_interval_ms: 30_000,
        }
    }
}

impl ActionConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub const fn result_ttl(&self) -> Duration {
        Duration::from_millis(self.result_ttl_ms)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Whether requests for agents owned elsewhere are relayed.
    pub enabled: bool,
    /// This replica's id in cluster membership.
    pub replica_id: String,
    pub protocol_version: u32,
    pub timeout_ms: u64,
    /// Peer replica id to base URL of its internal endpoint.
    pub peers: BTreeMap<String, String>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            replica_id: "replica-0".to_string(),
            protocol_version: 1,
            timeout_ms: 15_000,
            peers: BTreeMap::new(),
        }
    }
}

impl ForwardingConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
    pub reconciler: ReconcilerConfig,
    pub jobs: JobConfig,
    pub actions: ActionConfig,
    pub forwarding: ForwardingConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7771)),
            session: SessionConfig::default(),
            dispatch: DispatchConfig::default(),
            reconciler: ReconcilerConfig::default(),
            jobs: JobConfig::default(),
            actions: ActionConfig::default(),
            forwarding: ForwardingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cfg = JobConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..JobConfig::default()
        };
        assert_eq!(cfg.backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(800));
        assert_eq!(cfg.backoff(4), Duration::from_millis(1_000));
        assert_eq!(cfg.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let cfg: ControllerConfig =
            serde_json::from_str(r#"{"session":{"max_in_flight":4}}"#).unwrap();
        assert_eq!(cfg.session.max_in_flight, 4);
        assert_eq!(cfg.session.outbound_capacity, 32);
        assert_eq!(cfg.dispatch.default_timeout(), Duration::from_secs(5));
    }
}
