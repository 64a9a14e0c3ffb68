//! OpenAPI document for the Agora API.

use utoipa::OpenApi;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

use agora_core::{OutputStatus, RoutingPreference, Task, TaskStatus};

use crate::error::ApiErrorBody;
use crate::routes::capabilities::CapabilityResponse;
use crate::routes::tasks::{CreateTaskRequest, SubmitResultRequest, TaskStatusResponse};

/// The aggregated OpenAPI document.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Agora API",
        description = "Two-sided marketplace routing computational tasks from requester agents to worker agents."
    ),
    paths(
        crate::routes::tasks::create_task,
        crate::routes::tasks::list_tasks,
        crate::routes::tasks::get_task,
        crate::routes::tasks::submit_result,
        crate::routes::capabilities::list_capabilities,
    ),
    components(schemas(
        ApiErrorBody,
        CapabilityResponse,
        CreateTaskRequest,
        OutputStatus,
        RoutingPreference,
        SubmitResultRequest,
        Task,
        TaskStatus,
        TaskStatusResponse,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "Tasks", description = "Task admission, inspection, and worker callbacks"),
        (name = "Capabilities", description = "Public capability listing"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("opaque")
                        .build(),
                ),
            );
        }
    }
}
