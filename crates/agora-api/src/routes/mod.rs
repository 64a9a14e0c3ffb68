//! HTTP route handlers.

pub mod capabilities;
pub mod tasks;

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

/// `/v1` routes (task lifecycle is authenticated, capabilities is public).
pub fn v1_routes(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .merge(tasks::routes(state))
        .merge(capabilities::routes())
}
