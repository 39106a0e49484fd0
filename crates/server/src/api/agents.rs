//! Agent directory endpoints. All require `agent:view`.

use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, Query},
    http::header,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use utoipa::IntoParams;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::AppResources;
use crate::auth::{AgentView, RequireScope};
use crate::collaborators::AgentInfo;
use crate::error::{AuthError, ErrorBody};

/// Tag for OpenAPI documentation.
pub const AGENTS_TAG: &str = "Agents API";

const DEFAULT_LOG_LINES: u32 = 100;
const MAX_LOG_LINES: u32 = 5000;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LogParams {
    /// Container to read; defaults to the agent's main container
    container: Option<String>,
    /// Number of trailing lines to start from (max 5000)
    lines: Option<u32>,
}

/// Creates the agents API router.
#[tracing::instrument(skip_all)]
pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(list_agents))
        .routes(routes!(get_agent))
        .routes(routes!(agent_logs))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/api/agents",
    tag = AGENTS_TAG,
    operation_id = "List Agents",
    summary = "List known agents",
    responses(
        (status = 200, description = "Agents", body = Vec<AgentInfo>),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 403, description = "Token lacks agent:view", body = ErrorBody),
        (status = 503, description = "Agent directory unavailable", body = ErrorBody)
    ),
    security(("Authorization" = []))
)]
async fn list_agents(
    _auth: RequireScope<AgentView>,
    Extension(resources): Extension<AppResources>,
) -> Result<Json<Vec<AgentInfo>>, AuthError> {
    Ok(Json(resources.agents.list_agents().await?))
}

#[tracing::instrument(skip(_auth, resources))]
#[utoipa::path(
    get,
    path = "/api/agents/{id}",
    tag = AGENTS_TAG,
    operation_id = "Get Agent",
    summary = "Fetch one agent",
    params(("id" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Agent", body = AgentInfo),
        (status = 403, description = "Token lacks agent:view", body = ErrorBody),
        (status = 404, description = "Unknown agent", body = ErrorBody)
    ),
    security(("Authorization" = []))
)]
async fn get_agent(
    _auth: RequireScope<AgentView>,
    Extension(resources): Extension<AppResources>,
    Path(id): Path<String>,
) -> Result<Json<AgentInfo>, AuthError> {
    Ok(Json(resources.agents.get_agent(&id).await?))
}

#[tracing::instrument(skip(_auth, resources))]
#[utoipa::path(
    get,
    path = "/api/agents/{id}/logs",
    tag = AGENTS_TAG,
    operation_id = "Stream Agent Logs",
    summary = "Stream an agent's logs as plain text",
    params(("id" = String, Path, description = "Agent id"), LogParams),
    responses(
        (status = 200, description = "Log lines, streamed", content_type = "text/plain"),
        (status = 403, description = "Token lacks agent:view", body = ErrorBody),
        (status = 404, description = "Unknown agent", body = ErrorBody)
    ),
    security(("Authorization" = []))
)]
async fn agent_logs(
    _auth: RequireScope<AgentView>,
    Extension(resources): Extension<AppResources>,
    Path(id): Path<String>,
    Query(params): Query<LogParams>,
) -> Result<Response, AuthError> {
    let lines = params.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);
    let stream = resources
        .agents
        .stream_logs(&id, params.container.as_deref(), lines)
        .await?
        .map(|line| line.map(|l| l + "\n"));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}
