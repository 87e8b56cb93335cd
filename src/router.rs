//! Capability router: picks which worker should take a task category.
//!
//! The router never claims. Concurrency accounting comes from the lease
//! manager through [`ActiveClaims`], so there is one source of truth for
//! who holds what; routing races are settled by the atomic claim.

use crate::error::{BoardError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Category entry that matches every category.
pub const WILDCARD: &str = "*";

/// Source of per-worker active assignment counts (claimed or executing).
pub trait ActiveClaims {
    fn active_claims(&self, worker_id: &str) -> Result<usize>;
}

/// What a worker can take on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub worker_id: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Concurrent assignment limit; 0 means unlimited.
    #[serde(default)]
    pub max_concurrent: u32,
    /// Higher wins. Negative values are still eligible when nothing
    /// better has capacity.
    #[serde(default)]
    pub priority: i32,
}

impl AgentCapability {
    pub fn new(worker_id: impl Into<String>, categories: &[&str]) -> Self {
        Self {
            worker_id: worker_id.into(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            tools: Vec::new(),
            max_concurrent: 0,
            priority: 0,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn handles(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category || c == WILDCARD)
    }

    fn has_capacity(&self, active: usize) -> bool {
        self.max_concurrent == 0 || active < self.max_concurrent as usize
    }
}

/// In-memory capability registry.
#[derive(Debug, Default)]
pub struct CapabilityRouter {
    agents: RwLock<HashMap<String, AgentCapability>>,
}

impl CapabilityRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(agents: impl IntoIterator<Item = AgentCapability>) -> Self {
        let router = Self::new();
        for agent in agents {
            router.register_agent(agent);
        }
        router
    }

    /// Register or replace a worker's capability.
    pub fn register_agent(&self, capability: AgentCapability) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        debug!(worker = %capability.worker_id, categories = ?capability.categories, "agent registered");
        agents.insert(capability.worker_id.clone(), capability);
    }

    /// Remove a worker. Unknown ids are ignored.
    pub fn unregister_agent(&self, worker_id: &str) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        agents.remove(worker_id).is_some()
    }

    /// Registered capabilities, sorted by worker id.
    pub fn agents(&self) -> Vec<AgentCapability> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        list
    }

    /// Pick the highest-priority worker that handles `category` and has a
    /// free slot. Ties go to whichever candidate the map yields first.
    pub fn route_task(&self, category: &str, claims: &dyn ActiveClaims) -> Result<String> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());

        let mut best: Option<&AgentCapability> = None;
        for agent in agents.values().filter(|a| a.handles(category)) {
            let active = claims.active_claims(&agent.worker_id)?;
            if !agent.has_capacity(active) {
                debug!(worker = %agent.worker_id, active, limit = agent.max_concurrent, "agent at capacity");
                continue;
            }
            if best.is_none_or(|b| agent.priority > b.priority) {
                best = Some(agent);
            }
        }

        best.map(|a| a.worker_id.clone())
            .ok_or_else(|| BoardError::NoAgentAvailable {
                category: category.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeClaims(HashMap<String, usize>);

    impl FakeClaims {
        fn with(mut self, worker: &str, n: usize) -> Self {
            self.0.insert(worker.to_string(), n);
            self
        }
    }

    impl ActiveClaims for FakeClaims {
        fn active_claims(&self, worker_id: &str) -> Result<usize> {
            Ok(self.0.get(worker_id).copied().unwrap_or(0))
        }
    }

    #[test]
    fn highest_priority_handler_wins() {
        let router = CapabilityRouter::with_agents([
            AgentCapability::new("low", &["bug"]).with_priority(1),
            AgentCapability::new("high", &["bug"]).with_priority(5),
            AgentCapability::new("other", &["docs"]).with_priority(10),
        ]);
        assert_eq!(router.route_task("bug", &FakeClaims::default()).unwrap(), "high");
    }

    #[test]
    fn wildcard_handles_any_category() {
        let router = CapabilityRouter::with_agents([AgentCapability::new("generalist", &["*"])]);
        assert_eq!(
            router.route_task("anything", &FakeClaims::default()).unwrap(),
            "generalist"
        );
    }

    #[test]
    fn negative_priorities_are_still_eligible() {
        let router =
            CapabilityRouter::with_agents([AgentCapability::new("reluctant", &["bug"]).with_priority(-3)]);
        assert_eq!(router.route_task("bug", &FakeClaims::default()).unwrap(), "reluctant");
    }

    #[test]
    fn full_worker_is_skipped() {
        let router = CapabilityRouter::with_agents([
            AgentCapability::new("busy", &["bug"]).with_priority(9).with_max_concurrent(2),
            AgentCapability::new("idle", &["bug"]).with_priority(1),
        ]);
        let claims = FakeClaims::default().with("busy", 2);
        assert_eq!(router.route_task("bug", &claims).unwrap(), "idle");
    }

    #[test]
    fn only_candidate_at_capacity_means_no_agent() {
        let router =
            CapabilityRouter::with_agents([AgentCapability::new("solo", &["bug"]).with_max_concurrent(1)]);
        let claims = FakeClaims::default().with("solo", 1);
        let err = router.route_task("bug", &claims).unwrap_err();
        assert!(matches!(err, BoardError::NoAgentAvailable { .. }));
    }

    #[test]
    fn zero_max_concurrent_is_unlimited() {
        let router = CapabilityRouter::with_agents([AgentCapability::new("unbounded", &["bug"])]);
        let claims = FakeClaims::default().with("unbounded", 1_000);
        assert_eq!(router.route_task("bug", &claims).unwrap(), "unbounded");
    }

    #[test]
    fn register_and_unregister_are_idempotent() {
        let router = CapabilityRouter::new();
        router.register_agent(AgentCapability::new("a", &["bug"]));
        router.register_agent(AgentCapability::new("a", &["bug"]).with_priority(2));
        assert_eq!(router.agents().len(), 1);
        assert_eq!(router.agents()[0].priority, 2);

        assert!(router.unregister_agent("a"));
        assert!(!router.unregister_agent("a"));
        assert!(router.route_task("bug", &FakeClaims::default()).is_err());
    }
}
