//! Worker selection and scoring.
//!
//! The candidate pool comes from the store already filtered to online worker
//! agents on non-system accounts; this module applies the budget filter and
//! ranks by the task's routing preference. Sorting is stable, so store
//! insertion order breaks ties.

use agora_core::{Agent, AgentId, Result, RoutingPreference, Task};
use agora_store::Store;

/// Maximum number of alternatives returned for fallback dispatch.
pub const MAX_FALLBACKS: usize = 2;

const WEIGHT_COMPLIANCE: f64 = 0.20;
const WEIGHT_SUCCESS: f64 = 0.25;
const WEIGHT_REPUTATION: f64 = 0.25;
const WEIGHT_PRICE: f64 = 0.15;
const WEIGHT_SPEED: f64 = 0.15;

/// Selects workers for tasks based on budget and routing preference.
#[derive(Debug, Clone)]
pub struct Matchmaker {
    store: Store,
}

struct Candidate {
    agent: Agent,
    price: i64,
    compliance: f64,
    success_rate: f64,
    reputation: f64,
    avg_response_ms: i64,
}

impl Candidate {
    fn from_agent(agent: Agent, capability: &str, budget: i64) -> Option<Self> {
        let price = agent.price_for(capability)?;
        if price > budget {
            return None;
        }
        let compliance = agent.schema_compliance.unwrap_or(0.0).clamp(0.0, 1.0);
        // Unknown track records score neutrally rather than best or worst.
        let success_rate = agent.success_rate.unwrap_or(0.5).clamp(0.0, 1.0);
        let reputation = agent.reputation.unwrap_or(0.5).clamp(0.0, 1.0);
        let avg_response_ms = agent.avg_response_ms.unwrap_or(0).max(0);
        Some(Self {
            agent,
            price,
            compliance,
            success_rate,
            reputation,
            avg_response_ms,
        })
    }
}

impl Matchmaker {
    /// Creates a matchmaker over the given store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Returns the single best worker for the task, or `None` when no
    /// candidate survives filtering.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the worker pool query fails.
    pub fn find_best(&self, task: &Task) -> Result<Option<Agent>> {
        let candidates = rank(self.candidates(task, None)?, task.routing_preference);
        Ok(candidates.into_iter().next().map(|c| c.agent))
    }

    /// Returns up to [`MAX_FALLBACKS`] ranked alternatives, excluding the
    /// given agent.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the worker pool query fails.
    pub fn find_fallbacks(&self, task: &Task, exclude: AgentId) -> Result<Vec<Agent>> {
        let candidates = rank(self.candidates(task, Some(exclude))?, task.routing_preference);
        Ok(candidates
            .into_iter()
            .take(MAX_FALLBACKS)
            .map(|c| c.agent)
            .collect())
    }

    fn candidates(&self, task: &Task, exclude: Option<AgentId>) -> Result<Vec<Candidate>> {
        let workers = self.store.find_available_workers(&task.capability)?;
        Ok(workers
            .into_iter()
            .filter(|agent| exclude != Some(agent.id))
            .filter_map(|agent| Candidate::from_agent(agent, &task.capability, task.budget))
            .collect())
    }
}

/// Sorts candidates best-first. Sorting is stable, so ties keep store
/// insertion order.
fn rank(mut candidates: Vec<Candidate>, preference: RoutingPreference) -> Vec<Candidate> {
    match preference {
        RoutingPreference::Fastest => {
            candidates.sort_by_key(|c| c.avg_response_ms);
            candidates
        }
        RoutingPreference::Cheapest => {
            candidates.sort_by_key(|c| c.price);
            candidates
        }
        RoutingPreference::Auto => {
            let max_price = candidates.iter().map(|c| c.price).max().unwrap_or(1).max(1);
            let max_ms = candidates
                .iter()
                .map(|c| c.avg_response_ms)
                .max()
                .unwrap_or(1)
                .max(1);
            let mut scored: Vec<(f64, Candidate)> = candidates
                .into_iter()
                .map(|c| (auto_score(&c, max_price, max_ms), c))
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            scored.into_iter().map(|(_, c)| c).collect()
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn auto_score(candidate: &Candidate, max_price: i64, max_ms: i64) -> f64 {
    let price_norm = 1.0 - candidate.price as f64 / max_price as f64;
    let speed_norm = 1.0 - candidate.avg_response_ms as f64 / max_ms as f64;
    candidate.compliance * WEIGHT_COMPLIANCE
        + candidate.success_rate * WEIGHT_SUCCESS
        + candidate.reputation * WEIGHT_REPUTATION
        + price_norm * WEIGHT_PRICE
        + speed_norm * WEIGHT_SPEED
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{
        Account, AccountId, AgentRole, Availability, CapabilityOffer, RoutingPreference, Task,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    struct Fixture {
        store: Store,
        matchmaker: Matchmaker,
        account: AccountId,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().expect("open");
        let now = Utc::now();
        let account = Account {
            id: AccountId::generate(),
            email: "pool@example.com".into(),
            name: "pool".into(),
            credit_balance: 0,
            max_per_task: None,
            max_per_day: None,
            is_system: false,
            created_at: now,
            updated_at: now,
        };
        store.insert_account(&account).expect("account");
        Fixture {
            matchmaker: Matchmaker::new(store.clone()),
            store,
            account: account.id,
        }
    }

    fn worker(
        fixture: &Fixture,
        price: i64,
        avg_response_ms: Option<i64>,
        reputation: Option<f64>,
    ) -> AgentId {
        let now = Utc::now();
        let mut capabilities = BTreeMap::new();
        capabilities.insert("research".to_string(), CapabilityOffer { price });
        let agent = Agent {
            id: AgentId::generate(),
            account_id: fixture.account,
            role: AgentRole::Worker,
            endpoint_url: "http://worker.local/hook".into(),
            capabilities_offered: capabilities,
            availability: Availability::Online,
            schema_compliance: None,
            success_rate: None,
            reputation,
            avg_response_ms,
            created_at: now,
            updated_at: now,
        };
        fixture.store.insert_agent(&agent).expect("agent");
        agent.id
    }

    fn task(budget: i64, preference: RoutingPreference) -> Task {
        let mut task = Task::new(
            AgentId::generate(),
            "research",
            serde_json::json!({"query": "rust"}),
            budget,
            preference,
        );
        task.status = agora_core::TaskStatus::Matching;
        task
    }

    #[test]
    fn candidates_over_budget_are_discarded() {
        let fixture = fixture();
        worker(&fixture, 9, None, None);
        let cheap = worker(&fixture, 5, None, None);

        let best = fixture
            .matchmaker
            .find_best(&task(6, RoutingPreference::Auto))
            .expect("find");
        assert_eq!(best.map(|a| a.id), Some(cheap));
    }

    #[test]
    fn empty_pool_returns_none() {
        let fixture = fixture();
        let best = fixture
            .matchmaker
            .find_best(&task(10, RoutingPreference::Auto))
            .expect("find");
        assert!(best.is_none());
    }

    #[test]
    fn fastest_prefers_low_response_time() {
        let fixture = fixture();
        worker(&fixture, 5, Some(900), None);
        let fast = worker(&fixture, 5, Some(120), None);

        let best = fixture
            .matchmaker
            .find_best(&task(10, RoutingPreference::Fastest))
            .expect("find");
        assert_eq!(best.map(|a| a.id), Some(fast));
    }

    #[test]
    fn cheapest_prefers_low_price() {
        let fixture = fixture();
        worker(&fixture, 8, Some(10), None);
        let cheap = worker(&fixture, 4, Some(900), None);

        let best = fixture
            .matchmaker
            .find_best(&task(10, RoutingPreference::Cheapest))
            .expect("find");
        assert_eq!(best.map(|a| a.id), Some(cheap));
    }

    #[test]
    fn auto_prefers_reputation_when_price_and_speed_match() {
        let fixture = fixture();
        worker(&fixture, 5, Some(100), Some(0.2));
        let reputable = worker(&fixture, 5, Some(100), Some(0.9));

        let best = fixture
            .matchmaker
            .find_best(&task(10, RoutingPreference::Auto))
            .expect("find");
        assert_eq!(best.map(|a| a.id), Some(reputable));
    }

    #[test]
    fn auto_ties_break_by_insertion_order() {
        let fixture = fixture();
        let first = worker(&fixture, 5, Some(100), None);
        worker(&fixture, 5, Some(100), None);

        let best = fixture
            .matchmaker
            .find_best(&task(10, RoutingPreference::Auto))
            .expect("find");
        assert_eq!(best.map(|a| a.id), Some(first));
    }

    #[test]
    fn fallbacks_exclude_failed_worker_and_are_bounded() {
        let fixture = fixture();
        let failed = worker(&fixture, 5, Some(10), None);
        let second = worker(&fixture, 5, Some(20), None);
        let third = worker(&fixture, 5, Some(30), None);
        worker(&fixture, 5, Some(40), None);

        let fallbacks = fixture
            .matchmaker
            .find_fallbacks(&task(10, RoutingPreference::Fastest), failed)
            .expect("fallbacks");
        let ids: Vec<_> = fallbacks.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![second, third]);
    }
}
