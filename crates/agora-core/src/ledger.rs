//! Immutable double-entry credit ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::id::{AccountId, EntryId, TaskId};

/// The kind of credit movement a ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Budget held against a task at admission.
    EscrowLock,
    /// Unspent remainder returned to the requester at settlement.
    EscrowRelease,
    /// Worker's share of the actual cost.
    TaskEarning,
    /// Platform commission on the actual cost.
    PlatformFee,
    /// Full budget returned after a failed task.
    Refund,
}

impl EntryKind {
    /// Returns the constrained string stored at the persistence edge.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EscrowLock => "escrow_lock",
            Self::EscrowRelease => "escrow_release",
            Self::TaskEarning => "task_earning",
            Self::PlatformFee => "platform_fee",
            Self::Refund => "refund",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "escrow_lock" => Some(Self::EscrowLock),
            "escrow_release" => Some(Self::EscrowRelease),
            "task_earning" => Some(Self::TaskEarning),
            "platform_fee" => Some(Self::PlatformFee),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }

    /// Sign applied when summing entries against a balance: locks debit,
    /// everything else credits.
    #[must_use]
    pub const fn sign(self) -> i64 {
        match self {
            Self::EscrowLock => -1,
            _ => 1,
        }
    }
}

/// One immutable credit movement.
///
/// `amount` is always positive; direction comes from [`EntryKind::sign`].
/// `balance_after` records the account balance at append time, so per-account
/// history is auditable without replay.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LedgerEntry {
    /// Unique entry identifier.
    #[schema(value_type = String)]
    pub id: EntryId,
    /// The account whose balance moved.
    #[schema(value_type = String)]
    pub account_id: AccountId,
    /// The task this movement belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub task_id: Option<TaskId>,
    /// The kind of movement.
    pub kind: EntryKind,
    /// Positive amount moved.
    pub amount: i64,
    /// Account balance immediately after the movement.
    pub balance_after: i64,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Creates a new entry stamped with the current time.
    #[must_use]
    pub fn new(
        account_id: AccountId,
        task_id: Option<TaskId>,
        kind: EntryKind,
        amount: i64,
        balance_after: i64,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            account_id,
            task_id,
            kind,
            amount,
            balance_after,
            created_at: Utc::now(),
        }
    }

    /// The signed amount this entry contributes to its account balance.
    #[must_use]
    pub const fn signed_amount(&self) -> i64 {
        self.kind.sign() * self.amount
    }
}
