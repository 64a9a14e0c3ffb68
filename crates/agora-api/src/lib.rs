//! # agora-api
//!
//! HTTP composition layer for the Agora task marketplace.
//!
//! This crate wires the flow engine to the outside world:
//!
//! - **Authentication**: Bearer API keys resolved to an account + agent
//! - **Budget gate**: Per-task and per-day spend caps before admission
//! - **Routing**: Task lifecycle and capability listing endpoints
//! - **Observability**: Health/readiness probes, request tracing, OpenAPI
//!
//! ## Design Principles
//!
//! This crate is a **thin composition layer**: it contains no SQL and no
//! ledger arithmetic. All policy lives in `agora-flow`; all persistence in
//! `agora-store`.
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health                  - Health check
//! GET  /ready                   - Readiness check
//! POST /v1/tasks                - Admit a task (gate + validate + lock)
//! GET  /v1/tasks                - Caller's tasks
//! GET  /v1/tasks/{id}           - One task, per-account scoped
//! POST /v1/tasks/{id}/result    - Worker callback
//! GET  /v1/capabilities         - Public capability listing
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod budget;
pub mod config;
pub mod context;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::Principal;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::Server;
}
