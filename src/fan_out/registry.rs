//! # Supervised Task Registry
//!
//! In-process [`TaskScheduler`]. Each accepted launch becomes a tokio task that
//! the registry, not the launching future, owns: dropping or aborting the
//! caller leaves the child running.
//!
//! ## Per-child lifecycle
//!
//! ```text
//! launch ─► Running{1} ─ok─► Completed
//!              │ err
//!              ▼
//!         BackingOff{1, wait} ─► Running{2} ─► ... ─► Failed (attempts exhausted
//!                                                     or permanent error)
//! deadline elapsed at any point ─► TimedOut
//! close_parent on an Attached child ─► Cancelled
//! ```
//!
//! Launches are idempotent by key. While a run for a key is active, relaunching
//! returns the existing run. A completed run also deduplicates relaunches for
//! the configured completed-dedup window (zero by default), so a recurring
//! fan-out with the same keys runs again every period. A key whose run failed,
//! timed out or was cancelled can be launched again at once.
//!
//! Terminal records are kept for `terminal_retention` and then pruned.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::scheduler::{
    ChildTask, ChildTaskContext, ChildTaskError, ChildTaskStatus, DetachMode, LaunchError,
    LaunchHandle, LaunchRequest, TaskScheduler,
};
use crate::config::FanOutConfig;
use crate::constants;
use crate::logging::log_child_terminal;
use crate::reprocessing::processor::panic_message;

#[derive(Debug)]
struct ChildRecord {
    run_id: Uuid,
    task_ref: String,
    parent_id: Option<String>,
    detach_mode: DetachMode,
    launched_at: DateTime<Utc>,
    status: ChildTaskStatus,
    abort: Option<AbortHandle>,
    finished_at: Option<Instant>,
}

impl ChildRecord {
    /// Whether a new launch with this record's key returns this run instead
    fn deduplicates(&self, completed_window: Duration, now: Instant) -> bool {
        match (&self.status, self.finished_at) {
            (status, _) if !status.is_terminal() => true,
            (ChildTaskStatus::Completed { .. }, Some(finished_at)) => {
                now.saturating_duration_since(finished_at) < completed_window
            }
            _ => false,
        }
    }
}

/// Point-in-time view of one child run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildSnapshot {
    pub idempotency_key: String,
    pub run_id: Uuid,
    pub task_ref: String,
    pub parent_id: Option<String>,
    pub detach_mode: DetachMode,
    pub launched_at: DateTime<Utc>,
    pub status: ChildTaskStatus,
}

/// Registry of child task bodies and the runs launched from them
#[derive(Clone)]
pub struct SupervisedTaskRegistry {
    tasks: Arc<DashMap<String, Arc<dyn ChildTask>>>,
    children: Arc<DashMap<String, ChildRecord>>,
    accepting: Arc<AtomicBool>,
    changed: Arc<Notify>,
    completed_dedup_window: Duration,
    terminal_retention: Duration,
}

impl std::fmt::Debug for SupervisedTaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedTaskRegistry")
            .field("registered_tasks", &self.tasks.len())
            .field("children", &self.children.len())
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .field("completed_dedup_window", &self.completed_dedup_window)
            .field("terminal_retention", &self.terminal_retention)
            .finish()
    }
}

impl Default for SupervisedTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisedTaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            children: Arc::new(DashMap::new()),
            accepting: Arc::new(AtomicBool::new(true)),
            changed: Arc::new(Notify::new()),
            completed_dedup_window: Duration::from_secs(
                constants::fan_out::COMPLETED_DEDUP_WINDOW_SECONDS,
            ),
            terminal_retention: Duration::from_secs(constants::fan_out::TERMINAL_RETENTION_SECONDS),
        }
    }

    /// Registry with the dedup window and retention from `config`
    pub fn from_config(config: &FanOutConfig) -> Self {
        Self::new()
            .with_completed_dedup_window(config.completed_dedup_window())
            .with_terminal_retention(config.terminal_retention())
    }

    /// Deduplicate relaunches of a completed key for `window` after it finished
    pub fn with_completed_dedup_window(mut self, window: Duration) -> Self {
        self.completed_dedup_window = window;
        self.terminal_retention = self.terminal_retention.max(window);
        self
    }

    /// Keep terminal records for `retention`, never less than the dedup window
    pub fn with_terminal_retention(mut self, retention: Duration) -> Self {
        self.terminal_retention = retention.max(self.completed_dedup_window);
        self
    }

    /// Register (or replace) the body launched for `task_ref`
    pub fn register<T>(&self, task_ref: impl Into<String>, task: T)
    where
        T: ChildTask + 'static,
    {
        let task_ref = task_ref.into();
        debug!(task_ref = %task_ref, "Registered child task");
        self.tasks.insert(task_ref, Arc::new(task));
    }

    pub fn is_registered(&self, task_ref: &str) -> bool {
        self.tasks.contains_key(task_ref)
    }

    pub fn status(&self, idempotency_key: &str) -> Option<ChildTaskStatus> {
        self.children
            .get(idempotency_key)
            .map(|record| record.status.clone())
    }

    pub fn snapshot(&self) -> Vec<ChildSnapshot> {
        let mut snapshot: Vec<ChildSnapshot> = self
            .children
            .iter()
            .map(|entry| {
                let record = entry.value();
                ChildSnapshot {
                    idempotency_key: entry.key().clone(),
                    run_id: record.run_id,
                    task_ref: record.task_ref.clone(),
                    parent_id: record.parent_id.clone(),
                    detach_mode: record.detach_mode,
                    launched_at: record.launched_at,
                    status: record.status.clone(),
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.idempotency_key.cmp(&b.idempotency_key));
        snapshot
    }

    /// Runs not yet in a terminal state
    pub fn active_count(&self) -> usize {
        self.children
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .count()
    }

    /// Wait until the run for `idempotency_key` is terminal.
    ///
    /// `None` when the key was never launched.
    pub async fn wait_for_terminal(&self, idempotency_key: &str) -> Option<ChildTaskStatus> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.status(idempotency_key) {
                None => return None,
                Some(status) if status.is_terminal() => return Some(status),
                Some(_) => {}
            }
            notified.await;
        }
    }

    /// Wait until every launched run is terminal
    pub async fn wait_all_terminal(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// The parent `parent_id` has ended.
    ///
    /// Attached children still running are cancelled; abandoned children are
    /// left alone. Returns the number of cancelled children.
    #[instrument(skip(self))]
    pub fn close_parent(&self, parent_id: &str) -> usize {
        let mut cancelled = Vec::new();
        let mut detached = 0usize;

        for mut entry in self.children.iter_mut() {
            let record = entry.value_mut();
            if record.parent_id.as_deref() != Some(parent_id) || record.status.is_terminal() {
                continue;
            }
            match record.detach_mode {
                DetachMode::Abandon => detached += 1,
                DetachMode::Attached => {
                    record.status = ChildTaskStatus::Cancelled;
                    record.finished_at = Some(Instant::now());
                    if let Some(abort) = record.abort.take() {
                        abort.abort();
                    }
                    cancelled.push(entry.key().clone());
                }
            }
        }

        for key in &cancelled {
            log_child_terminal(key, &ChildTaskStatus::Cancelled);
        }
        if !cancelled.is_empty() {
            self.changed.notify_waiters();
        }

        info!(
            parent_id = %parent_id,
            cancelled = cancelled.len(),
            detached,
            "🧹 FAN_OUT: Parent closed"
        );
        cancelled.len()
    }

    /// Remove terminal records that finished at least `older_than` ago.
    ///
    /// Returns the number of records removed. Active runs are never pruned.
    pub fn prune_terminal(&self, older_than: Duration) -> usize {
        let now = Instant::now();
        let mut pruned = 0usize;
        self.children.retain(|_, record| match record.finished_at {
            Some(finished_at)
                if record.status.is_terminal()
                    && now.saturating_duration_since(finished_at) >= older_than =>
            {
                pruned += 1;
                false
            }
            _ => true,
        });
        if pruned > 0 {
            debug!(pruned, "Pruned terminal child records");
        }
        pruned
    }

    /// Stop accepting launches. Runs already accepted continue.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!(
                active = self.active_count(),
                "🛑 FAN_OUT: Registry no longer accepting launches"
            );
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn validate(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        let invalid = |reason: String| LaunchError::InvalidRequest {
            key: request.idempotency_key.clone(),
            reason,
        };
        if request.idempotency_key.trim().is_empty() {
            return Err(invalid("idempotency key must not be empty".to_string()));
        }
        if request.execution_timeout.is_zero() {
            return Err(invalid("execution timeout must be greater than 0".to_string()));
        }
        request
            .retry_policy
            .validate()
            .map_err(|e| invalid(e.to_string()))
    }

    /// Update a run's status unless it was superseded or already finished
    fn update_status(&self, key: &str, run_id: Uuid, status: ChildTaskStatus) -> bool {
        match self.children.get_mut(key) {
            Some(mut record) if record.run_id == run_id && !record.status.is_terminal() => {
                record.status = status;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, key: &str, run_id: Uuid, status: ChildTaskStatus) {
        let recorded = match self.children.get_mut(key) {
            Some(mut record) if record.run_id == run_id && !record.status.is_terminal() => {
                record.status = status.clone();
                record.abort = None;
                record.finished_at = Some(Instant::now());
                true
            }
            _ => false,
        };
        if recorded {
            log_child_terminal(key, &status);
        }
        self.prune_terminal(self.terminal_retention);
        self.changed.notify_waiters();
    }

    fn spawn_supervised(
        &self,
        task: Arc<dyn ChildTask>,
        request: LaunchRequest,
        run_id: Uuid,
    ) -> AbortHandle {
        tokio::spawn(self.clone().supervise(task, request, run_id)).abort_handle()
    }

    async fn supervise(self, task: Arc<dyn ChildTask>, request: LaunchRequest, run_id: Uuid) {
        let key = request.idempotency_key.clone();
        let deadline = request.execution_timeout;
        let mut attempts = 0u32;

        let outcome = tokio::time::timeout(
            deadline,
            self.run_attempts(task.as_ref(), &request, run_id, &mut attempts),
        )
        .await;
        let status = match outcome {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    unit_key = %key,
                    attempts,
                    deadline_ms = deadline.as_millis() as u64,
                    "⏰ FAN_OUT: Child task exceeded its execution deadline"
                );
                ChildTaskStatus::TimedOut { attempts }
            }
        };

        self.finish(&key, run_id, status);
    }

    async fn run_attempts(
        &self,
        task: &dyn ChildTask,
        request: &LaunchRequest,
        run_id: Uuid,
        attempts: &mut u32,
    ) -> ChildTaskStatus {
        let key = request.idempotency_key.as_str();
        let policy = &request.retry_policy;

        loop {
            *attempts += 1;
            let attempt = *attempts;
            if !self.update_status(key, run_id, ChildTaskStatus::Running { attempt }) {
                debug!(
                    unit_key = %key,
                    attempt,
                    "Run cancelled or superseded - not starting attempt"
                );
                return ChildTaskStatus::Cancelled;
            }

            let context = ChildTaskContext {
                idempotency_key: key.to_string(),
                params: request.params.clone(),
                attempt,
                run_id,
            };
            let error = match AssertUnwindSafe(task.execute(context)).catch_unwind().await {
                Ok(Ok(())) => return ChildTaskStatus::Completed { attempts: attempt },
                Ok(Err(error)) => error,
                Err(payload) => ChildTaskError::retryable(format!(
                    "child task panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };

            if !error.retryable || !policy.allows_attempt_after(attempt) {
                return ChildTaskStatus::Failed {
                    attempts: attempt,
                    last_error: error.message,
                };
            }

            let wait = policy.delay_for_retry(attempt);
            let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
            debug!(
                unit_key = %key,
                attempt,
                wait_ms,
                error = %error.message,
                "Child task attempt failed - backing off"
            );
            self.update_status(key, run_id, ChildTaskStatus::BackingOff { attempt, wait_ms });
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl TaskScheduler for SupervisedTaskRegistry {
    #[instrument(skip(self, request), fields(unit_key = %request.idempotency_key, task_ref = %request.task_ref))]
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchHandle, LaunchError> {
        self.validate(&request)?;

        if !self.is_accepting() {
            return Err(LaunchError::Rejected {
                key: request.idempotency_key,
                reason: "registry is shut down".to_string(),
            });
        }

        let task = self
            .tasks
            .get(&request.task_ref)
            .map(|task| Arc::clone(task.value()))
            .ok_or_else(|| LaunchError::UnknownTask(request.task_ref.clone()))?;

        let key = request.idempotency_key.clone();
        let run_id = Uuid::new_v4();
        let launched_at = Utc::now();
        let record = |abort: AbortHandle| ChildRecord {
            run_id,
            task_ref: request.task_ref.clone(),
            parent_id: request.parent_id.clone(),
            detach_mode: request.detach_mode,
            launched_at,
            status: ChildTaskStatus::Running { attempt: 1 },
            abort: Some(abort),
            finished_at: None,
        };

        // The entry guard is held until the record carries its abort handle,
        // so close_parent never sees an Attached run it cannot abort.
        match self.children.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if existing
                    .get()
                    .deduplicates(self.completed_dedup_window, Instant::now())
                {
                    debug!(existing_run = %existing.get().run_id, "Launch deduplicated");
                    return Ok(LaunchHandle {
                        idempotency_key: key,
                        run_id: existing.get().run_id,
                        launched_at: existing.get().launched_at,
                        deduplicated: true,
                    });
                }
                let abort = self.spawn_supervised(task, request.clone(), run_id);
                existing.insert(record(abort));
            }
            Entry::Vacant(vacant) => {
                let abort = self.spawn_supervised(task, request.clone(), run_id);
                vacant.insert(record(abort));
            }
        }

        Ok(LaunchHandle {
            idempotency_key: key,
            run_id,
            launched_at,
            deduplicated: false,
        })
    }
}
