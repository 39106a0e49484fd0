use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::ConfigError;

/// Request-level failures of the authentication core and the handlers it guards.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("upstream error ({}): {body}", status.map_or_else(|| "no status".to_string(), |s| s.to_string()))]
    Upstream { status: Option<u16>, body: String },
    #[error("invalid or expired state")]
    Csrf,
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("access denied for {0}")]
    AccessDenied(String),
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn insufficient_scope(scope: &str) -> Self {
        AuthError::Forbidden(format!("Token requires '{scope}' scope"))
    }

    /// Stable machine-readable code returned in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Configuration(_) => "configuration_error",
            AuthError::Upstream { .. } => "upstream_error",
            AuthError::Csrf => "invalid_state",
            AuthError::Unauthenticated(_) => "invalid_token",
            AuthError::Forbidden(_) => "insufficient_scope",
            AuthError::AccessDenied(_) => "access_denied",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::Conflict(_) => "conflict",
            AuthError::BadRequest(_) => "bad_request",
            AuthError::NotFound(_) => "not_found",
            AuthError::Unavailable(_) => "service_unavailable",
            AuthError::Database(_) | AuthError::Internal(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AuthError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AuthError::Csrf | AuthError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AuthError::Unauthenticated(_) | AuthError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Forbidden(_) | AuthError::AccessDenied(_) => StatusCode::FORBIDDEN,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Database(_) | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text safe to show to the caller. Upstream bodies and database
    /// details stay in the logs.
    fn public_description(&self) -> Option<String> {
        match self {
            AuthError::Configuration(msg)
            | AuthError::Unauthenticated(msg)
            | AuthError::Forbidden(msg)
            | AuthError::Conflict(msg)
            | AuthError::BadRequest(msg)
            | AuthError::NotFound(msg)
            | AuthError::Unavailable(msg) => Some(msg.clone()),
            AuthError::Csrf => Some("State parameter is missing, unknown or expired".into()),
            AuthError::AccessDenied(_) => Some("This account is not permitted to sign in".into()),
            AuthError::InvalidCredentials => Some("Invalid username or password".into()),
            AuthError::Upstream { .. } => Some("Identity provider request failed".into()),
            AuthError::Database(_) | AuthError::Internal(_) => None,
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Error code (e.g. "invalid_token", "insufficient_scope")
    pub error: String,
    /// Human-readable error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        }
        let body = ErrorBody {
            error: self.code().to_string(),
            error_description: self.public_description(),
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

/// Failures while assembling the application at startup. All of them are fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to prepare account: {0}")]
    Account(#[from] AuthError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
