//! Agent identity established during the stream handshake.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier of a remote agent.
///
/// Survives reconnects: a new stream from the same agent carries the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (never valid on the wire).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of an authenticated agent.
///
/// Built by an [`Authenticator`](crate::Authenticator) from the agent's
/// `hello` message; apps can attach arbitrary metadata (node name, labels).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Agent identifier.
    pub agent_id: AgentId,

    /// Protocol/capability version reported by the agent.
    pub version: String,

    /// Arbitrary metadata for app-specific needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AgentIdentity {
    /// Create an identity without metadata.
    #[must_use]
    pub fn new(agent_id: AgentId, version: impl Into<String>) -> Self {
        Self {
            agent_id,
            version: version.into(),
            metadata: HashMap::new(),
        }
    }

    /// Create an identity with metadata.
    #[must_use]
    pub fn with_metadata(
        agent_id: AgentId,
        version: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            agent_id,
            version: version.into(),
            metadata,
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_agent_id_is_empty() {
        assert!(AgentId::new("  ").is_empty());
        assert!(!AgentId::new("pmm-agent-1").is_empty());
    }

    #[test]
    fn test_agent_id_is_transparent_on_the_wire() {
        let json = serde_json::to_string(&AgentId::new("a1")).unwrap();
        assert_eq!(json, "\"a1\"");
    }
}
