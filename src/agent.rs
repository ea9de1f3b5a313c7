//! Agent contract and the registry the router dispatches through.
//!
//! Agents are pure functions of `(event, diary)`: they hold no reference
//! back to the Gateway and cannot invoke other agents directly. Business
//! logic (medical decision rules, LLM prompt construction) is deliberately
//! not implemented here; agents exist to be registered and driven by the
//! router, and are exercised in tests via small stub implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::agent_response::AgentResult;
use crate::diary::PatientDiary;
use crate::domain_types::AgentName;
use crate::error::AgentError;
use crate::event::EventEnvelope;

/// A specialist processor registered by name.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Processes one event against the current diary, returning the updated
    /// diary, any hand-off events, and any outbound responses.
    async fn process(&self, event: &EventEnvelope, diary: PatientDiary) -> Result<AgentResult, AgentError>;
}

/// Registry mapping agent names to their implementations.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentName, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Registers `agent` under `name`, replacing any prior registration.
    pub fn register(&mut self, name: AgentName, agent: Arc<dyn Agent>) {
        self.agents.insert(name, agent);
    }

    /// Looks up an agent by name.
    #[must_use]
    pub fn get(&self, name: &AgentName) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    /// Names of every registered agent, for health reporting.
    #[must_use]
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().map(|n| n.as_ref().to_string()).collect()
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// `true` if no agents are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_response::AgentResult;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn process(&self, _event: &EventEnvelope, diary: PatientDiary) -> Result<AgentResult, AgentError> {
            Ok(AgentResult::unchanged(diary))
        }
    }

    #[tokio::test]
    async fn registered_agent_is_found_by_name() {
        let mut registry = AgentRegistry::default();
        let name = AgentName::try_new("intake").unwrap();
        registry.register(name.clone(), Arc::new(EchoAgent));

        assert!(registry.get(&name).is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&AgentName::try_new("clinical").unwrap()).is_none());
    }
}
