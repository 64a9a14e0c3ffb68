//! Requester and worker agents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::id::{AccountId, AgentId};

/// The role an agent plays in the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Submits tasks only.
    Requester,
    /// Executes tasks only.
    Worker,
    /// Both submits and executes tasks.
    Both,
}

impl AgentRole {
    /// Returns the constrained string stored at the persistence edge.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Worker => "worker",
            Self::Both => "both",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requester" => Some(Self::Requester),
            "worker" => Some(Self::Worker),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    /// Returns true when the agent may be selected as a worker.
    #[must_use]
    pub const fn can_work(self) -> bool {
        matches!(self, Self::Worker | Self::Both)
    }
}

/// Whether the agent is accepting dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Accepting dispatches.
    Online,
    /// Not accepting dispatches.
    Offline,
}

impl Availability {
    /// Returns the constrained string stored at the persistence edge.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// A quoted price for one capability, in credits per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CapabilityOffer {
    /// Price per task in credits.
    pub price: i64,
}

/// An HTTP-reachable persona owned by an account.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Agent {
    /// Unique agent identifier.
    #[schema(value_type = String)]
    pub id: AgentId,
    /// Owning account.
    #[schema(value_type = String)]
    pub account_id: AccountId,
    /// Role in the marketplace.
    pub role: AgentRole,
    /// Webhook endpoint dispatched to when the agent works a task.
    pub endpoint_url: String,
    /// Capability name to quoted price.
    pub capabilities_offered: BTreeMap<String, CapabilityOffer>,
    /// Whether the agent is accepting dispatches.
    pub availability: Availability,
    /// Observed share of schema-conformant outputs, in [0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_compliance: Option<f64>,
    /// Observed success rate, in [0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    /// Requester-sourced reputation, in [0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<f64>,
    /// Observed mean response time in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_response_ms: Option<i64>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Returns the quoted price for a capability, if the agent offers it.
    #[must_use]
    pub fn price_for(&self, capability: &str) -> Option<i64> {
        self.capabilities_offered.get(capability).map(|o| o.price)
    }

    /// Returns true when the agent advertises the capability.
    #[must_use]
    pub fn offers(&self, capability: &str) -> bool {
        self.capabilities_offered.contains_key(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips() {
        for role in [AgentRole::Requester, AgentRole::Worker, AgentRole::Both] {
            assert_eq!(AgentRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(AgentRole::parse("supervisor"), None);
    }

    #[test]
    fn only_worker_roles_can_work() {
        assert!(AgentRole::Worker.can_work());
        assert!(AgentRole::Both.can_work());
        assert!(!AgentRole::Requester.can_work());
    }

    #[test]
    fn price_lookup_uses_offer_map() {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("summarize".to_string(), CapabilityOffer { price: 3 });
        let agent = Agent {
            id: AgentId::generate(),
            account_id: AccountId::generate(),
            role: AgentRole::Worker,
            endpoint_url: "http://worker.local/hook".into(),
            capabilities_offered: capabilities,
            availability: Availability::Online,
            schema_compliance: None,
            success_rate: None,
            reputation: None,
            avg_response_ms: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(agent.price_for("summarize"), Some(3));
        assert_eq!(agent.price_for("research"), None);
        assert!(agent.offers("summarize"));
    }
}
