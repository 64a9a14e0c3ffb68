//! # agora-flow
//!
//! Task routing engine for the Agora marketplace.
//!
//! This crate implements the lifecycle between admission and settlement:
//!
//! - **Escrow**: Double-entry credit movements — lock, settle, refund
//! - **Schema Registry**: Per-capability input/output validation and
//!   deadline/price configuration, loaded at startup
//! - **Matchmaker**: Scores and ranks available workers by routing preference
//! - **Dispatcher**: Match, webhook delivery, deadline monitoring, fallback,
//!   and callback settlement
//! - **Runner**: Durable queue consumer executing dispatch attempts and
//!   deadline watchers on bounded workers
//!
//! ## Guarantees
//!
//! - Admission (credit lock + task insert + dispatch enqueue) is one
//!   transaction; no partial admission is observable
//! - Settlement and refunds cover the ledger and the task row atomically
//! - The callback/deadline race is resolved by compare-and-swap on task
//!   status; the loser no-ops

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dispatcher;
pub mod escrow;
pub mod matchmaker;
pub mod registry;
pub mod runner;

pub use dispatcher::{Dispatcher, ResultSubmission};
pub use matchmaker::Matchmaker;
pub use registry::{CapabilityInfo, SchemaRegistry};
pub use runner::{Runner, RunnerConfig, RunnerHandle};
