//! Interfaces to the services behind the protected routes.
//!
//! The agent directory (cluster discovery, log streaming) and the task queue
//! live outside this crate. Handlers reach them only through these traits,
//! and only after the authorization middleware has admitted the caller.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::error::AuthError;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("{0} is unavailable")]
    Unavailable(&'static str),
    #[error("collaborator failure: {0}")]
    Backend(String),
}

impl From<CollaboratorError> for AuthError {
    fn from(e: CollaboratorError) -> Self {
        match e {
            CollaboratorError::NotFound(what) => AuthError::NotFound(format!("{what} not found")),
            CollaboratorError::Invalid(msg) => AuthError::BadRequest(msg),
            CollaboratorError::Unavailable(service) => {
                AuthError::Unavailable(format!("{service} is not available"))
            }
            CollaboratorError::Backend(msg) => AuthError::Internal(msg),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    /// e.g. "running", "pending"
    pub status: String,
    pub containers: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskSpec {
    /// Agent the task is addressed to
    pub agent_id: String,
    /// Free-form instruction for the agent
    pub instruction: String,
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskRecord {
    pub id: String,
    pub user_id: String,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

pub type LogStream = BoxStream<'static, Result<String, CollaboratorError>>;

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<AgentInfo>, CollaboratorError>;

    async fn get_agent(&self, id: &str) -> Result<AgentInfo, CollaboratorError>;

    /// Last `lines` log lines of `container` (or the agent's default), then follow.
    async fn stream_logs(
        &self,
        id: &str,
        container: Option<&str>,
        lines: u32,
    ) -> Result<LogStream, CollaboratorError>;
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, spec: TaskSpec, user_id: &str) -> Result<TaskRecord, CollaboratorError>;

    async fn get(&self, task_id: &str) -> Result<TaskRecord, CollaboratorError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TaskRecord>, CollaboratorError>;

    /// Cancel a task owned by `user_id`.
    async fn cancel(&self, task_id: &str, user_id: &str) -> Result<(), CollaboratorError>;

    async fn stats(&self) -> Result<QueueStats, CollaboratorError>;
}

/// Stand-in for a collaborator that is not wired up. Every call answers 503.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disabled;

#[async_trait]
impl AgentDirectory for Disabled {
    async fn list_agents(&self) -> Result<Vec<AgentInfo>, CollaboratorError> {
        Err(CollaboratorError::Unavailable("agent directory"))
    }

    async fn get_agent(&self, _id: &str) -> Result<AgentInfo, CollaboratorError> {
        Err(CollaboratorError::Unavailable("agent directory"))
    }

    async fn stream_logs(
        &self,
        _id: &str,
        _container: Option<&str>,
        _lines: u32,
    ) -> Result<LogStream, CollaboratorError> {
        Err(CollaboratorError::Unavailable("agent directory"))
    }
}

#[async_trait]
impl TaskQueue for Disabled {
    async fn submit(&self, _spec: TaskSpec, _user_id: &str) -> Result<TaskRecord, CollaboratorError> {
        Err(CollaboratorError::Unavailable("task queue"))
    }

    async fn get(&self, _task_id: &str) -> Result<TaskRecord, CollaboratorError> {
        Err(CollaboratorError::Unavailable("task queue"))
    }

    async fn list_for_user(&self, _user_id: &str) -> Result<Vec<TaskRecord>, CollaboratorError> {
        Err(CollaboratorError::Unavailable("task queue"))
    }

    async fn cancel(&self, _task_id: &str, _user_id: &str) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Unavailable("task queue"))
    }

    async fn stats(&self) -> Result<QueueStats, CollaboratorError> {
        Err(CollaboratorError::Unavailable("task queue"))
    }
}
