//! Tasks and the task status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::id::{AgentId, TaskId};

/// Maximum number of fallback retries before a task fails permanently.
pub const MAX_RETRIES: u32 = 2;

/// The task lifecycle state machine.
///
/// ```text
///             created ──(admit+lock)──▶ matching
/// matching ──(worker found)──▶ dispatched ──(2xx)──▶ in_progress
/// matching ──(no worker / retries exhausted)──▶ failed
/// dispatched ──(non-2xx or network err)──▶ matching
/// in_progress ──(callback success|partial)──▶ completed
/// in_progress ──(callback error / deadline)──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted but not yet persisted in the matching state.
    Created,
    /// Waiting for a worker to be selected.
    Matching,
    /// Payload sent to a worker, awaiting its acknowledgement.
    Dispatched,
    /// Worker acknowledged; awaiting its callback.
    InProgress,
    /// Terminal: settled successfully.
    Completed,
    /// Terminal: refunded.
    Failed,
}

impl TaskStatus {
    /// Returns the constrained string stored at the persistence edge.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Matching => "matching",
            Self::Dispatched => "dispatched",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "matching" => Some(Self::Matching),
            "dispatched" => Some(Self::Dispatched),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true for `completed` and `failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true when a worker callback may still settle the task.
    #[must_use]
    pub const fn accepts_result(self) -> bool {
        matches!(self, Self::Dispatched | Self::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-reported outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// The worker produced a full result.
    Success,
    /// The worker produced a usable but incomplete result.
    Partial,
    /// The worker failed to produce a result.
    Error,
}

impl OutputStatus {
    /// Returns the constrained string stored at the persistence edge.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns true when the outcome pays the worker.
    #[must_use]
    pub const fn is_payable(self) -> bool {
        matches!(self, Self::Success | Self::Partial)
    }
}

/// Caller-selected worker scoring strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPreference {
    /// Lowest observed response time first.
    Fastest,
    /// Lowest quoted price first.
    Cheapest,
    /// Weighted blend of compliance, success, reputation, price, and speed.
    #[default]
    Auto,
}

impl RoutingPreference {
    /// Returns the constrained string stored at the persistence edge.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fastest => "fastest",
            Self::Cheapest => "cheapest",
            Self::Auto => "auto",
        }
    }

    /// Parses the persisted string form; unknown values fall back to auto.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "fastest" => Self::Fastest,
            "cheapest" => Self::Cheapest,
            _ => Self::Auto,
        }
    }
}

/// A unit of routed work.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Task {
    /// Unique task identifier.
    #[schema(value_type = String)]
    pub id: TaskId,
    /// The agent that submitted the task.
    #[schema(value_type = String)]
    pub requester_agent_id: AgentId,
    /// The worker assigned by the matchmaker; set once matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub worker_agent_id: Option<AgentId>,
    /// The capability the task requires.
    pub capability: String,
    /// Input payload validated against the capability's input schema.
    #[schema(value_type = Object)]
    pub input_payload: Value,
    /// Worker-produced output payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub output_payload: Option<Value>,
    /// Worker-reported outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_status: Option<OutputStatus>,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Maximum credits the requester will spend.
    pub budget: i64,
    /// Credits actually charged; set at settlement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<i64>,
    /// Platform commission; set at settlement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_fee: Option<i64>,
    /// Worker scoring strategy.
    pub routing_preference: RoutingPreference,
    /// Callback deadline; set at dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Number of fallback attempts consumed.
    pub retry_count: u32,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new task in the `created` state.
    #[must_use]
    pub fn new(
        requester_agent_id: AgentId,
        capability: impl Into<String>,
        input_payload: Value,
        budget: i64,
        routing_preference: RoutingPreference,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            requester_agent_id,
            worker_agent_id: None,
            capability: capability.into(),
            input_payload,
            output_payload: None,
            output_status: None,
            status: TaskStatus::Created,
            budget,
            actual_cost: None,
            platform_fee: None,
            routing_preference,
            deadline: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once fallback attempts are exhausted.
    #[must_use]
    pub const fn retries_exhausted(&self) -> bool {
        self.retry_count > MAX_RETRIES
    }
}
