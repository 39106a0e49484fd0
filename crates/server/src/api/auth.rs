//! Authentication endpoints (/api/auth/*).
//!
//! - `GET /oauth/login` - redirect to the identity provider
//! - `GET /oauth/callback` - provider callback, redirects to the app root
//! - `GET /oauth/status` - whether federated login is configured
//! - `POST /login`, `POST /register` - local credentials
//! - `POST /logout` - best-effort logout, always succeeds
//! - `GET /me` - the caller's resolved identity

use axum::{
    Extension, Json,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::AppResources;
use crate::auth::AUTH_TAG;
use crate::auth::middleware::{Authenticated, bearer_token};
use crate::auth::orchestrator::CallbackParams;
use crate::auth::session::{IssuedSession, SessionOrigin};
use crate::entity::user_account::{self, IdentityProvider};
use crate::error::{AuthError, ErrorBody};

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    /// Always "Bearer"
    pub token_type: String,
    /// Seconds until the token expires
    pub expires_in: i64,
}

impl From<IssuedSession> for TokenResponse {
    fn from(session: IssuedSession) -> Self {
        Self {
            expires_in: session.expires_in(),
            access_token: session.token,
            token_type: "Bearer".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AccountResponse {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub identity_provider: IdentityProvider,
}

impl From<user_account::Model> for AccountResponse {
    fn from(account: user_account::Model) -> Self {
        Self {
            id: account.id,
            username: account.username,
            email: account.email,
            display_name: account.display_name,
            identity_provider: account.identity_provider,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct MeResponse {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub origin: SessionOrigin,
    /// Granted scopes; absent for unrestricted sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub configured: bool,
    pub provider_url: String,
}

/// Creates the authentication router.
#[tracing::instrument(skip_all)]
pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(oauth_login))
        .routes(routes!(oauth_callback))
        .routes(routes!(oauth_status))
        .routes(routes!(login))
        .routes(routes!(register))
        .routes(routes!(logout))
        .routes(routes!(me))
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

#[tracing::instrument(skip(resources))]
#[utoipa::path(
    get,
    path = "/oauth/login",
    tag = AUTH_TAG,
    operation_id = "OAuth2 Login",
    summary = "Start a federated login",
    description = "Redirects the browser to the identity provider's authorization endpoint \
                   with a freshly issued, single-use `state`.",
    responses(
        (status = 302, description = "Redirect to the identity provider"),
        (status = 500, description = "Federated login is not configured", body = ErrorBody)
    )
)]
async fn oauth_login(Extension(resources): Extension<AppResources>) -> Result<Response, AuthError> {
    let url = resources.auth.begin_login().await?;
    Ok(found(url.as_str()))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/oauth/callback",
    tag = AUTH_TAG,
    operation_id = "OAuth2 Callback",
    summary = "Complete a federated login",
    description = "Validates `state`, exchanges `code` and redirects to the application root \
                   with either `token=<session token>` or `error=<code>` in the query string.",
    params(CallbackParams),
    responses(
        (status = 302, description = "Redirect to the application root")
    )
)]
async fn oauth_callback(
    Extension(resources): Extension<AppResources>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let outcome = resources.auth.complete_callback(params).await;
    found(&resources.auth.redirect_location(&outcome))
}

#[tracing::instrument(skip(resources))]
#[utoipa::path(
    get,
    path = "/oauth/status",
    tag = AUTH_TAG,
    operation_id = "OAuth2 Status",
    summary = "Report whether federated login is available",
    responses(
        (status = 200, description = "Federated login status", body = StatusResponse)
    )
)]
async fn oauth_status(Extension(resources): Extension<AppResources>) -> Json<StatusResponse> {
    let status = resources.auth.status();
    Json(StatusResponse {
        configured: status.configured,
        provider_url: status.provider_url,
    })
}

#[tracing::instrument(skip(resources, payload), fields(username = %payload.username))]
#[utoipa::path(
    post,
    path = "/login",
    tag = AUTH_TAG,
    operation_id = "Local Login",
    summary = "Sign in with a username and password",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session issued", body = TokenResponse),
        (status = 401, description = "Invalid username or password", body = ErrorBody)
    )
)]
async fn login(
    Extension(resources): Extension<AppResources>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, AuthError> {
    let session = resources
        .auth
        .login_local(&payload.username, &payload.password)
        .await?;
    Ok(Json(session.into()))
}

#[tracing::instrument(skip(resources, payload), fields(username = %payload.username))]
#[utoipa::path(
    post,
    path = "/register",
    tag = AUTH_TAG,
    operation_id = "Local Registration",
    summary = "Create a local account",
    description = "Only available when local registration is enabled.",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = AccountResponse),
        (status = 400, description = "Invalid username or password", body = ErrorBody),
        (status = 403, description = "Registration is disabled", body = ErrorBody),
        (status = 409, description = "Username already taken", body = ErrorBody)
    )
)]
async fn register(
    Extension(resources): Extension<AppResources>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AuthError> {
    let account = resources
        .auth
        .register_local(&payload.username, &payload.password, payload.email.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(account.into())))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/logout",
    tag = AUTH_TAG,
    operation_id = "Logout",
    summary = "End the current session",
    description = "Attempts to revoke the provider token behind the session. \
                   Always succeeds; local tokens otherwise remain valid until they expire.",
    responses(
        (status = 200, description = "Logged out", content_type = "application/json", example = json!({"status": "logged_out"}))
    ),
    security(("Authorization" = []))
)]
async fn logout(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
) -> impl IntoResponse {
    resources.auth.logout(bearer_token(&headers).ok()).await;
    Json(json!({ "status": "logged_out" }))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/me",
    tag = AUTH_TAG,
    operation_id = "Current User",
    summary = "Identity of the caller",
    responses(
        (status = 200, description = "Resolved identity", body = MeResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorBody)
    ),
    security(("Authorization" = []))
)]
async fn me(Authenticated(user): Authenticated) -> Json<MeResponse> {
    Json(MeResponse {
        scopes: user.grant.scopes(),
        user_id: user.user_id,
        username: user.username,
        email: user.email,
        origin: user.origin,
    })
}
