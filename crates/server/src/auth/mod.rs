//! Dual-mode authentication: OAuth2/OIDC relying party plus local credentials,
//! unified behind one session token and one request-authorization contract.

pub mod credentials;
pub mod federated;
pub mod middleware;
pub mod orchestrator;
pub mod password;
pub mod session;
pub mod state;

pub use middleware::{
    AgentControl, AgentView, AuthGate, AuthMode, Authenticated, AuthenticatedUser, RequireScope,
};
pub use orchestrator::AuthOrchestrator;
pub use session::{ScopeGrant, SessionCodec};

/// Tag for OpenAPI documentation.
pub const AUTH_TAG: &str = "Authentication";
