//! Public capability listing.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use agora_flow::CapabilityInfo;

use crate::server::AppState;

/// One row of the public capability listing.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CapabilityResponse {
    /// Capability name.
    pub name: String,
    /// Indicative price in credits per task.
    pub price: i64,
    /// Human-readable deadline description.
    pub deadline: String,
}

impl From<CapabilityInfo> for CapabilityResponse {
    fn from(info: CapabilityInfo) -> Self {
        Self {
            name: info.name,
            price: info.price,
            deadline: info.deadline,
        }
    }
}

/// Lists the capabilities the platform accepts tasks for.
///
/// Public: no authentication required.
#[utoipa::path(
    get,
    path = "/v1/capabilities",
    responses(
        (status = 200, description = "Supported capabilities", body = [CapabilityResponse]),
    ),
    tag = "Capabilities"
)]
pub(crate) async fn list_capabilities(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<CapabilityResponse>> {
    Json(
        state
            .registry
            .capabilities()
            .into_iter()
            .map(CapabilityResponse::from)
            .collect(),
    )
}

/// Creates the capability routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/capabilities", get(list_capabilities))
}
