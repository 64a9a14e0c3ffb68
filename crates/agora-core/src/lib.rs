//! # agora-core
//!
//! Domain model for the Agora task marketplace.
//!
//! This crate defines the entities shared by every other Agora component:
//!
//! - **Identifiers**: Strongly-typed UUIDs for accounts, agents, tasks,
//!   ledger entries, and queued jobs
//! - **Accounts & Agents**: Credit-holding principals and the HTTP-reachable
//!   personas they own
//! - **Tasks**: The unit of routed work and its status state machine
//! - **Ledger**: Immutable double-entry credit movements
//! - **Errors**: The shared error type mapped to HTTP codes at the API edge
//!
//! ## Design Principles
//!
//! This crate holds data and invariants only — no I/O, no SQL, no HTTP.
//! Persistence lives in `agora-store`; policy lives in `agora-flow`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod agent;
pub mod error;
pub mod id;
pub mod ledger;
pub mod task;

pub use account::Account;
pub use agent::{Agent, AgentRole, Availability, CapabilityOffer};
pub use error::{Error, Result};
pub use id::{AccountId, AgentId, EntryId, JobId, TaskId};
pub use ledger::{EntryKind, LedgerEntry};
pub use task::{OutputStatus, RoutingPreference, Task, TaskStatus};
