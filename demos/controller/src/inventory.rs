//! Desired agent configuration held in memory.
//!
//! Seeded from the config file and replaced through the ops API.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use fleet_core::{
    AgentId, DesiredStateSource, message::SetStateRequest, traits::StateSourceError,
};

#[derive(Debug, Default)]
pub struct Inventory {
    desired: RwLock<HashMap<AgentId, SetStateRequest>>,
}

impl Inventory {
    #[must_use]
    pub fn new(desired: HashMap<AgentId, SetStateRequest>) -> Self {
        Self {
            desired: RwLock::new(desired),
        }
    }

    /// Replace an agent's desired state.
    pub fn set(&self, agent_id: AgentId, state: SetStateRequest) {
        self.desired
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id, state);
    }

    /// Drop an agent from the inventory. Returns whether it was known.
    pub fn remove(&self, agent_id: &AgentId) -> bool {
        self.desired
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id)
            .is_some()
    }
}

#[async_trait]
impl DesiredStateSource for Inventory {
    async fn desired_state(&self, agent_id: &AgentId) -> Result<SetStateRequest, StateSourceError> {
        self.desired
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StateSourceError::UnknownAgent(agent_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_agent_is_reported() {
        let inventory = Inventory::default();
        let agent_id = AgentId::new("a1");
        assert!(matches!(
            inventory.desired_state(&agent_id).await,
            Err(StateSourceError::UnknownAgent(_))
        ));

        inventory.set(agent_id.clone(), SetStateRequest::default());
        assert!(inventory.desired_state(&agent_id).await.is_ok());
        assert!(inventory.remove(&agent_id));
        assert!(!inventory.remove(&agent_id));
    }
}
