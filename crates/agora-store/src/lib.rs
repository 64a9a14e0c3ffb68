//! # agora-store
//!
//! Relational persistence for the Agora task marketplace, backed by `SQLite`.
//!
//! This crate is the single source of truth for accounts, agents, tasks, the
//! append-only credit ledger, API key lookups, and the durable dispatch
//! queue. Everything above it (`agora-flow`, `agora-api`) holds only
//! transient copies of rows.
//!
//! ## Design Principles
//!
//! - **Parameter substitution everywhere**: no query is built by string
//!   formatting over external input
//! - **CAS semantics**: task status transitions use compare-and-swap so the
//!   callback/deadline race has exactly one winner
//! - **Transactional admission**: credit lock, task insert, and queue enqueue
//!   happen in one `IMMEDIATE` transaction via [`Store::with_tx`]
//! - **Idempotent migrations**: schema creation and bootstrap seeds can run
//!   on every startup

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

mod migrations;
pub mod queue;
pub mod store;

pub use queue::{Job, JobKind};
pub use store::{CasResult, Store, StoreTx};
