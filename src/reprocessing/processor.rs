//! Per-item processor seam and the outcome of one invocation.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;

use super::work_source::WorkItemId;

/// A processor reported failure for one item
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ProcessingFailure {
    pub reason: String,
}

impl ProcessingFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Processes one claimed item.
///
/// Implementations are invoked concurrently up to the admission ceiling and
/// must tolerate being called again for the same item: a claim that lapses
/// before the item is resolved can be handed out a second time.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, item: &WorkItemId) -> Result<(), ProcessingFailure>;
}

/// [`Processor`] over an async closure
pub struct FnProcessor<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnProcessor<F, Fut>
where
    F: Fn(WorkItemId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingFailure>> + Send,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F, Fut>
where
    F: Fn(WorkItemId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingFailure>> + Send,
{
    async fn process(&self, item: &WorkItemId) -> Result<(), ProcessingFailure> {
        (self.func)(item.clone()).await
    }
}

/// How one processor invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed(String),
    TimedOut(Duration),
    Panicked(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded)
    }

    /// Failure description for logs, `None` on success
    pub fn error_message(&self) -> Option<String> {
        match self {
            ItemOutcome::Succeeded => None,
            ItemOutcome::Failed(reason) => Some(reason.clone()),
            ItemOutcome::TimedOut(after) => Some(format!("timed out after {after:?}")),
            ItemOutcome::Panicked(message) => Some(format!("processor panicked: {message}")),
        }
    }
}

impl From<Result<(), ProcessingFailure>> for ItemOutcome {
    fn from(result: Result<(), ProcessingFailure>) -> Self {
        match result {
            Ok(()) => ItemOutcome::Succeeded,
            Err(failure) => ItemOutcome::Failed(failure.reason),
        }
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
