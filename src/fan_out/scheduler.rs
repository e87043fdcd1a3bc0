//! Scheduling substrate seam for detached child tasks.
//!
//! A [`TaskScheduler`] accepts launch requests and acknowledges them; it owns
//! the child's lifetime from then on. Child bodies implement [`ChildTask`].

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry_policy::RetryPolicy;

/// What happens to a child when its parent closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachMode {
    /// Child keeps running to its own completion
    #[default]
    Abandon,
    /// Child is cancelled together with its parent
    Attached,
}

/// Everything needed to start one child task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub task_ref: String,
    pub params: serde_json::Value,
    /// Deterministic key; relaunching while a run for it is active never
    /// duplicates that run
    pub idempotency_key: String,
    pub retry_policy: RetryPolicy,
    /// Deadline for the whole execution, retries and waits included
    pub execution_timeout: Duration,
    pub detach_mode: DetachMode,
    pub parent_id: Option<String>,
}

/// Acknowledgment of an accepted launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchHandle {
    pub idempotency_key: String,
    pub run_id: Uuid,
    pub launched_at: DateTime<Utc>,
    /// The key already had a run; this handle points at it
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("no child task registered for '{0}'")]
    UnknownTask(String),

    #[error("launch of '{key}' rejected: {reason}")]
    Rejected { key: String, reason: String },

    #[error("invalid launch request '{key}': {reason}")]
    InvalidRequest { key: String, reason: String },
}

/// Accepts child task launches
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Acknowledge (not complete) a launch
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchHandle, LaunchError>;
}

/// Lifecycle of one child run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildTaskStatus {
    Running { attempt: u32 },
    BackingOff { attempt: u32, wait_ms: u64 },
    Completed { attempts: u32 },
    Failed { attempts: u32, last_error: String },
    TimedOut { attempts: u32 },
    Cancelled,
}

impl ChildTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChildTaskStatus::Completed { .. }
                | ChildTaskStatus::Failed { .. }
                | ChildTaskStatus::TimedOut { .. }
                | ChildTaskStatus::Cancelled
        )
    }
}

/// Failure of one child attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ChildTaskError {
    pub message: String,
    /// `false` ends the run immediately regardless of remaining attempts
    pub retryable: bool,
}

impl ChildTaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Per-attempt input handed to a child task
#[derive(Debug, Clone)]
pub struct ChildTaskContext {
    pub idempotency_key: String,
    pub params: serde_json::Value,
    /// 1-indexed attempt number
    pub attempt: u32,
    pub run_id: Uuid,
}

/// Body of a child task, invoked once per attempt
#[async_trait]
pub trait ChildTask: Send + Sync {
    async fn execute(&self, context: ChildTaskContext) -> Result<(), ChildTaskError>;
}

/// [`ChildTask`] over an async closure
pub struct FnChildTask<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnChildTask<F, Fut>
where
    F: Fn(ChildTaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ChildTaskError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> ChildTask for FnChildTask<F, Fut>
where
    F: Fn(ChildTaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ChildTaskError>> + Send,
{
    async fn execute(&self, context: ChildTaskContext) -> Result<(), ChildTaskError> {
        (self.func)(context).await
    }
}
