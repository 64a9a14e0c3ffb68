//! Task lifecycle routes.
//!
//! ## Routes
//!
//! - `POST /v1/tasks` - Admit a task (gate + validate + lock + enqueue)
//! - `GET /v1/tasks` - The caller's tasks
//! - `GET /v1/tasks/{id}` - One task, per-account scoped
//! - `POST /v1/tasks/{id}/result` - Worker callback
//!
//! ## Authentication
//!
//! All routes require a bearer API key. The result callback additionally
//! requires the key's agent to be the task's assigned worker.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use agora_core::{AgentId, OutputStatus, RoutingPreference, Task, TaskId, TaskStatus};
use agora_flow::ResultSubmission;

use crate::budget::budget_gate;
use crate::context::Principal;
use crate::error::ApiError;
use crate::server::AppState;

/// Request body for `POST /v1/tasks`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    /// The requester agent submitting the task; must belong to the caller.
    pub requester_agent_id: String,
    /// The capability the task requires.
    pub capability_required: String,
    /// Input payload, validated against the capability's input schema.
    #[schema(value_type = Object)]
    pub input_payload: Value,
    /// Maximum credits to spend on this task.
    pub budget: i64,
    /// Worker scoring strategy; unknown values fall back to `auto`.
    #[serde(default)]
    pub routing_preference: Option<String>,
}

/// Task id + status, returned by admission and settlement.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskStatusResponse {
    /// The task's id.
    pub task_id: String,
    /// The task's current lifecycle state.
    pub status: TaskStatus,
}

/// Request body for `POST /v1/tasks/{id}/result`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SubmitResultRequest {
    /// The produced output payload.
    #[schema(value_type = Object)]
    pub output_payload: Value,
    /// Worker-reported outcome; defaults to `success`.
    #[serde(default)]
    pub output_status: Option<OutputStatus>,
    /// Credits charged; `0` or absent falls back to the task budget.
    #[serde(default)]
    pub actual_cost: i64,
}

/// Admits a new task.
///
/// Runs after the budget gate: the body has already passed budget and
/// capability-cap checks. This handler validates the input payload, locks
/// the budget, persists the task, and enqueues the dispatch — atomically.
#[utoipa::path(
    post,
    path = "/v1/tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 202, description = "Task admitted", body = TaskStatusResponse),
        (status = 400, description = "Malformed request", body = ApiErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ApiErrorBody),
        (status = 402, description = "Insufficient credits", body = ApiErrorBody),
        (status = 403, description = "Capability or budget cap violated", body = ApiErrorBody),
        (status = 422, description = "Input payload fails the capability schema", body = ApiErrorBody),
    ),
    tag = "Tasks",
    security(("bearerAuth" = []))
)]
pub(crate) async fn create_task(
    principal: Principal,
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = principal.request_id.clone();

    let requester_agent_id: AgentId = request
        .requester_agent_id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid requester_agent_id").with_request_id(request_id.clone()))?;
    if request.capability_required.is_empty() {
        return Err(ApiError::bad_request("capability_required is required")
            .with_request_id(request_id));
    }
    if request.budget <= 0 {
        return Err(
            ApiError::bad_request("budget must be a positive integer").with_request_id(request_id)
        );
    }

    let requester = state.store.get_agent(requester_agent_id).map_err(|_| {
        ApiError::bad_request("unknown requester_agent_id").with_request_id(request_id.clone())
    })?;
    if requester.account_id != principal.account.id {
        return Err(
            ApiError::forbidden("requester agent does not belong to the caller")
                .with_request_id(request_id),
        );
    }

    state
        .registry
        .validate_input(&request.capability_required, &request.input_payload)
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;

    let routing = request
        .routing_preference
        .as_deref()
        .map_or(RoutingPreference::Auto, RoutingPreference::parse);
    let mut task = Task::new(
        requester_agent_id,
        request.capability_required,
        request.input_payload,
        request.budget,
        routing,
    );
    state
        .dispatcher
        .admit(&mut task, principal.account.id)
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskStatusResponse {
            task_id: task.id.to_string(),
            status: task.status,
        }),
    ))
}

/// Returns one task, visible only to the accounts behind its requester or
/// assigned worker.
#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    params(("id" = String, Path, description = "Task ID")),
    responses(
        (status = 200, description = "The task", body = Task),
        (status = 401, description = "Missing or invalid API key", body = ApiErrorBody),
        (status = 404, description = "No such task visible to the caller", body = ApiErrorBody),
    ),
    tag = "Tasks",
    security(("bearerAuth" = []))
)]
pub(crate) async fn get_task(
    principal: Principal,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = principal.request_id.clone();
    let task_id = parse_task_id(&id, &request_id)?;
    let task = state
        .store
        .get_task(task_id)
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;

    if !task_visible_to(&state, &task, &principal)? {
        return Err(
            ApiError::not_found(format!("task not found: {task_id}")).with_request_id(request_id)
        );
    }
    Ok(Json(task))
}

/// Lists the caller's tasks, newest first.
///
/// Covers both sides of the marketplace: tasks the caller's agents
/// requested and tasks assigned to them as workers.
#[utoipa::path(
    get,
    path = "/v1/tasks",
    responses(
        (status = 200, description = "Tasks requested by or assigned to the caller", body = [Task]),
        (status = 401, description = "Missing or invalid API key", body = ApiErrorBody),
    ),
    tag = "Tasks",
    security(("bearerAuth" = []))
)]
pub(crate) async fn list_tasks(
    principal: Principal,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state
        .store
        .list_tasks_for_account(principal.account.id)
        .map_err(|e| ApiError::from(e).with_request_id(principal.request_id.clone()))?;
    Ok(Json(tasks))
}

/// Worker result callback.
///
/// The calling agent must be the task's assigned worker. A payable outcome
/// settles credits; an error outcome refunds the requester. Either way the
/// task becomes terminal, and later callbacks receive 409.
#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/result",
    params(("id" = String, Path, description = "Task ID")),
    request_body = SubmitResultRequest,
    responses(
        (status = 200, description = "Result settled", body = TaskStatusResponse),
        (status = 400, description = "Malformed request", body = ApiErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ApiErrorBody),
        (status = 403, description = "Caller is not the assigned worker", body = ApiErrorBody),
        (status = 404, description = "No such task", body = ApiErrorBody),
        (status = 409, description = "Task is already terminal", body = ApiErrorBody),
    ),
    tag = "Tasks",
    security(("bearerAuth" = []))
)]
pub(crate) async fn submit_result(
    principal: Principal,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SubmitResultRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = principal.request_id.clone();
    let task_id = parse_task_id(&id, &request_id)?;
    let agent = principal.require_agent()?;

    tracing::info!(
        task_id = %task_id,
        agent_id = %agent.id,
        output_status = ?request.output_status,
        "task result callback"
    );

    let submission = ResultSubmission {
        output_payload: request.output_payload,
        output_status: request.output_status.unwrap_or(OutputStatus::Success),
        actual_cost: request.actual_cost,
    };
    let task = state
        .dispatcher
        .settle_result(task_id, agent.id, &submission)
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    Ok(Json(TaskStatusResponse {
        task_id: task.id.to_string(),
        status: task.status,
    }))
}

fn parse_task_id(raw: &str, request_id: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("invalid task id").with_request_id(request_id.to_string()))
}

fn task_visible_to(
    state: &Arc<AppState>,
    task: &Task,
    principal: &Principal,
) -> Result<bool, ApiError> {
    let requester_account = state
        .store
        .get_agent(task.requester_agent_id)
        .map_err(ApiError::from)?
        .account_id;
    if requester_account == principal.account.id {
        return Ok(true);
    }
    if let Some(worker_id) = task.worker_agent_id {
        let worker_account = state
            .store
            .get_agent(worker_id)
            .map_err(ApiError::from)?
            .account_id;
        if worker_account == principal.account.id {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Creates the task routes, with the budget gate on admission only.
pub fn routes(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tasks",
            post(create_task).layer(middleware::from_fn_with_state(
                Arc::clone(state),
                budget_gate,
            )),
        )
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/result", post(submit_result))
}
