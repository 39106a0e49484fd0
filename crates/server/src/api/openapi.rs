//! OpenAPI/Utoipa configuration.

use crate::api::{agents::AGENTS_TAG, health::MISC_TAG, tasks::TASKS_TAG};
use crate::auth::AUTH_TAG;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

/// Security addon for OpenAPI documentation.
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            let bearer = HttpBuilder::new()
                .scheme(HttpAuthScheme::Bearer)
                .bearer_format("JWT")
                .description(Some(
                    "Session token from `/api/auth/login` or the `token` parameter of the OAuth2 callback redirect.",
                ))
                .build();
            components.add_security_scheme("Authorization", SecurityScheme::Http(bearer));
        }
    }
}

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "Agent Portal API",
        version = "1.0.0",
        description = "Federated (OAuth2/OIDC) and local authentication for the agent portal, \
                       plus the scope-gated agent and task endpoints."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = AUTH_TAG, description = "Login, logout and identity endpoints"),
        (name = AGENTS_TAG, description = "Agent directory (requires agent:view)"),
        (name = TASKS_TAG, description = "Task queue (agent:view to read, agent:control to modify)")
    )
)]
pub struct ApiDoc;
