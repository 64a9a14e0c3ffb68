//! Credit-holding accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::id::AccountId;

/// A principal holding a credit balance and optional spending caps.
///
/// Balances are integer credits and are mutated only by the ledger inside a
/// transaction. System accounts (platform fee, admin) are excluded from
/// worker selection.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Account {
    /// Unique account identifier.
    #[schema(value_type = String)]
    pub id: AccountId,
    /// Contact email.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Current credit balance. Never negative.
    pub credit_balance: i64,
    /// Optional ceiling on a single task's budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_per_task: Option<i64>,
    /// Optional ceiling on cumulative escrow locks per day.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_per_day: Option<i64>,
    /// True for platform-internal accounts; never selected as workers.
    pub is_system: bool,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Returns true when the account can cover the given amount.
    #[must_use]
    pub const fn can_cover(&self, amount: i64) -> bool {
        self.credit_balance >= amount
    }
}
