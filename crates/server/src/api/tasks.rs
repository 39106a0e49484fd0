//! Task queue endpoints. Reads require `agent:view`, mutations `agent:control`.

use axum::{
    Extension, Json,
    extract::Path,
    http::StatusCode,
};
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::AppResources;
use crate::auth::{AgentControl, AgentView, AuthenticatedUser, RequireScope};
use crate::collaborators::{QueueStats, TaskRecord, TaskSpec};
use crate::error::{AuthError, ErrorBody};

/// Tag for OpenAPI documentation.
pub const TASKS_TAG: &str = "Tasks API";

/// Creates the tasks API router.
#[tracing::instrument(skip_all)]
pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(list_tasks, submit_task))
        .routes(routes!(task_stats))
        .routes(routes!(get_task, cancel_task))
}

/// Owners see their own tasks; unrestricted operators see every task.
fn visible_to(task: &TaskRecord, user: &AuthenticatedUser) -> bool {
    user.is_unrestricted() || task.user_id == user.user_id
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/api/tasks",
    tag = TASKS_TAG,
    operation_id = "List Tasks",
    summary = "List the caller's tasks",
    responses(
        (status = 200, description = "Tasks submitted by the caller", body = Vec<TaskRecord>),
        (status = 403, description = "Token lacks agent:view", body = ErrorBody),
        (status = 503, description = "Task queue unavailable", body = ErrorBody)
    ),
    security(("Authorization" = []))
)]
async fn list_tasks(
    RequireScope(user, ..): RequireScope<AgentView>,
    Extension(resources): Extension<AppResources>,
) -> Result<Json<Vec<TaskRecord>>, AuthError> {
    Ok(Json(resources.tasks.list_for_user(&user.user_id).await?))
}

#[tracing::instrument(skip_all, fields(agent_id = %spec.agent_id))]
#[utoipa::path(
    post,
    path = "/api/tasks",
    tag = TASKS_TAG,
    operation_id = "Submit Task",
    summary = "Queue a task for an agent",
    request_body = TaskSpec,
    responses(
        (status = 201, description = "Task queued", body = TaskRecord),
        (status = 400, description = "Invalid task", body = ErrorBody),
        (status = 403, description = "Token lacks agent:control", body = ErrorBody)
    ),
    security(("Authorization" = []))
)]
async fn submit_task(
    RequireScope(user, ..): RequireScope<AgentControl>,
    Extension(resources): Extension<AppResources>,
    Json(spec): Json<TaskSpec>,
) -> Result<(StatusCode, Json<TaskRecord>), AuthError> {
    if spec.instruction.trim().is_empty() {
        return Err(AuthError::BadRequest("instruction must not be empty".into()));
    }
    let task = resources.tasks.submit(spec, &user.user_id).await?;
    tracing::info!(task_id = %task.id, user_id = %user.user_id, "Task submitted");
    Ok((StatusCode::CREATED, Json(task)))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/api/tasks/stats",
    tag = TASKS_TAG,
    operation_id = "Task Queue Stats",
    summary = "Queue counters",
    responses(
        (status = 200, description = "Queue statistics", body = QueueStats),
        (status = 403, description = "Token lacks agent:view", body = ErrorBody)
    ),
    security(("Authorization" = []))
)]
async fn task_stats(
    _auth: RequireScope<AgentView>,
    Extension(resources): Extension<AppResources>,
) -> Result<Json<QueueStats>, AuthError> {
    Ok(Json(resources.tasks.stats().await?))
}

#[tracing::instrument(skip_all, fields(task_id = %id))]
#[utoipa::path(
    get,
    path = "/api/tasks/{id}",
    tag = TASKS_TAG,
    operation_id = "Get Task",
    summary = "Fetch one task",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task", body = TaskRecord),
        (status = 403, description = "Token lacks agent:view", body = ErrorBody),
        (status = 404, description = "Unknown task", body = ErrorBody)
    ),
    security(("Authorization" = []))
)]
async fn get_task(
    RequireScope(user, ..): RequireScope<AgentView>,
    Extension(resources): Extension<AppResources>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, AuthError> {
    let task = resources.tasks.get(&id).await?;
    if !visible_to(&task, &user) {
        return Err(AuthError::NotFound(format!("task {id} not found")));
    }
    Ok(Json(task))
}

#[tracing::instrument(skip_all, fields(task_id = %id))]
#[utoipa::path(
    delete,
    path = "/api/tasks/{id}",
    tag = TASKS_TAG,
    operation_id = "Cancel Task",
    summary = "Cancel one of the caller's tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 204, description = "Task cancelled"),
        (status = 403, description = "Token lacks agent:control", body = ErrorBody),
        (status = 404, description = "Unknown task", body = ErrorBody)
    ),
    security(("Authorization" = []))
)]
async fn cancel_task(
    RequireScope(user, ..): RequireScope<AgentControl>,
    Extension(resources): Extension<AppResources>,
    Path(id): Path<String>,
) -> Result<StatusCode, AuthError> {
    resources.tasks.cancel(&id, &user.user_id).await?;
    tracing::info!(task_id = %id, user_id = %user.user_id, "Task cancelled");
    Ok(StatusCode::NO_CONTENT)
}
