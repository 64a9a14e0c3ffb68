//! Strongly-typed identifiers for Agora entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different id kinds at compile time
//! - **Globally unique**: Random UUIDs, no coordination required
//! - **Orderable**: Total order used for deterministic multi-account locking
//!
//! Two account ids are well-known and seeded at bootstrap: the platform fee
//! account and the admin account.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random id.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " id '{}': {}"), s, e),
                })
            }
        }
    };
}

entity_id!(
    /// A unique identifier for a credit-holding account.
    AccountId,
    "account"
);

entity_id!(
    /// A unique identifier for a requester or worker agent.
    AgentId,
    "agent"
);

entity_id!(
    /// A unique identifier for a routed task.
    TaskId,
    "task"
);

entity_id!(
    /// A unique identifier for a credit ledger entry.
    EntryId,
    "ledger entry"
);

entity_id!(
    /// A unique identifier for a queued background job.
    JobId,
    "job"
);

impl AccountId {
    /// The platform fee account, credited with commission at settlement.
    #[must_use]
    pub const fn platform() -> Self {
        Self(Uuid::from_u128(1))
    }

    /// The admin account seeded at bootstrap.
    #[must_use]
    pub const fn admin() -> Self {
        Self(Uuid::from_u128(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_strings() {
        let id = TaskId::generate();
        let parsed: TaskId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_id_is_rejected() {
        let err = "not-a-uuid".parse::<AgentId>().unwrap_err();
        assert!(matches!(err, Error::InvalidId { .. }));
    }

    #[test]
    fn well_known_accounts_are_distinct_and_stable() {
        assert_ne!(AccountId::platform(), AccountId::admin());
        assert_eq!(
            AccountId::platform().to_string(),
            "00000000-0000-0000-0000-000000000001"
        );
        assert_eq!(
            AccountId::admin().to_string(),
            "00000000-0000-0000-0000-000000000002"
        );
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = AccountId::platform();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
    }
}
