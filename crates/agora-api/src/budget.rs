//! Budget gate middleware for task admission.
//!
//! Applied to `POST /v1/tasks` only, after principal resolution. The gate
//! peeks at the request body to enforce:
//!
//! - a positive integer `budget` (400 otherwise)
//! - the capability allow-list from the schema registry (403)
//! - the account's per-task cap (403)
//! - the account's per-day cap, counting `escrow_lock` entries since
//!   midnight UTC (403)
//!
//! The body is buffered and restored, so the handler can read it again.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;

use crate::context::Principal;
use crate::error::ApiError;
use crate::server::AppState;

/// Largest admission body the gate will buffer.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The admission fields the gate peeks at. Everything else is left for the
/// handler.
#[derive(Debug, Deserialize)]
struct BudgetPeek {
    budget: Option<i64>,
    capability_required: Option<String>,
}

/// Budget gate middleware.
pub async fn budget_gate(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match check(&state, req).await {
        Ok(req) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

async fn check(state: &Arc<AppState>, req: Request<Body>) -> Result<Request<Body>, ApiError> {
    let (mut parts, body) = req.into_parts();
    let principal = Principal::from_request_parts(&mut parts, state).await?;
    let request_id = principal.request_id.clone();

    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::bad_request("failed to read body").with_request_id(request_id.clone()))?;
    let peek: BudgetPeek = serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::bad_request("invalid JSON body").with_request_id(request_id.clone()))?;

    let budget = peek
        .budget
        .filter(|b| *b > 0)
        .ok_or_else(|| {
            ApiError::bad_request("budget must be a positive integer")
                .with_request_id(request_id.clone())
        })?;

    if let Some(capability) = peek.capability_required.as_deref() {
        if !state.registry.allows(capability) {
            return Err(ApiError::forbidden(format!(
                "capability {capability} is not allowed"
            ))
            .with_request_id(request_id));
        }
    }

    let account = &principal.account;
    if let Some(per_task) = account.max_per_task {
        if budget > per_task {
            return Err(ApiError::forbidden(format!(
                "budget {budget} exceeds per-task limit {per_task}"
            ))
            .with_request_id(request_id));
        }
    }

    if let Some(per_day) = account.max_per_day {
        let spent = state
            .store
            .locked_since(account.id, today_midnight_utc())
            .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
        if spent + budget > per_day {
            return Err(ApiError::forbidden(format!(
                "daily spend {spent} + budget {budget} exceeds daily limit {per_day}"
            ))
            .with_request_id(request_id));
        }
    }

    // Restore the body; the principal is already cached in the extensions.
    Ok(Request::from_parts(parts, Body::from(bytes)))
}

/// Midnight today in the server's canonical timezone (UTC).
fn today_midnight_utc() -> DateTime<Utc> {
    Utc::now()
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_tolerates_extra_fields() {
        let peek: BudgetPeek = serde_json::from_str(
            r#"{"budget": 5, "capability_required": "research", "input_payload": {"query": "x"}}"#,
        )
        .expect("parse");
        assert_eq!(peek.budget, Some(5));
        assert_eq!(peek.capability_required.as_deref(), Some("research"));
    }

    #[test]
    fn peek_missing_budget_is_none() {
        let peek: BudgetPeek = serde_json::from_str("{}").expect("parse");
        assert_eq!(peek.budget, None);
    }

    #[test]
    fn midnight_is_start_of_today() {
        let midnight = today_midnight_utc();
        assert_eq!(midnight.date_naive(), Utc::now().date_naive());
        assert_eq!(midnight.time(), NaiveTime::MIN);
    }
}
