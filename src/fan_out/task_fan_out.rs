//! # Task Fan-Out
//!
//! Launch one detached child task per independent unit and return once every
//! launch has been acknowledged. A rejected launch affects only its own unit.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::scheduler::{LaunchError, LaunchHandle, LaunchRequest, TaskScheduler};
use crate::config::FanOutConfig;
use crate::constants;
use crate::error::{ReprocessorError, Result};
use crate::logging::log_launch_result;

/// One independent parameter set driving one child task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutUnit {
    /// Kind of work, e.g. `email_weekly_analytics`
    pub kind: String,
    /// Unit identity within the kind, e.g. a tenant id
    pub unit_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl FanOutUnit {
    pub fn new(kind: impl Into<String>, unit_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            unit_id: unit_id.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Deterministic `<kind>/<unit_id>` key
    pub fn key(&self) -> String {
        format!(
            "{}{}{}",
            self.kind,
            constants::fan_out::KEY_SEPARATOR,
            self.unit_id
        )
    }
}

/// Produces the units a fan-out run launches children for
#[async_trait]
pub trait UnitSource: Send + Sync {
    async fn next_units(&self) -> Result<Vec<FanOutUnit>>;
}

/// Launch acknowledgment for one unit
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub unit_key: String,
    pub result: std::result::Result<LaunchHandle, LaunchError>,
}

/// Per-unit acknowledgments of one fan-out run
#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub parent_id: String,
    pub outcomes: Vec<LaunchOutcome>,
}

impl FanOutReport {
    pub fn launched(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.launched()
    }

    pub fn all_launched(&self) -> bool {
        self.failed() == 0
    }

    pub fn handle(&self, unit_key: &str) -> Option<&LaunchHandle> {
        self.outcomes
            .iter()
            .find(|o| o.unit_key == unit_key)
            .and_then(|o| o.result.as_ref().ok())
    }
}

/// Launches children through a [`TaskScheduler`] using the configured policy
pub struct TaskFanOut<T: TaskScheduler + ?Sized> {
    scheduler: Arc<T>,
    config: FanOutConfig,
}

impl<T: TaskScheduler + ?Sized> std::fmt::Debug for TaskFanOut<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFanOut")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: TaskScheduler + ?Sized> TaskFanOut<T> {
    pub fn new(scheduler: Arc<T>, config: FanOutConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { scheduler, config })
    }

    pub fn config(&self) -> &FanOutConfig {
        &self.config
    }

    fn request_for(&self, parent_id: &str, unit: &FanOutUnit) -> LaunchRequest {
        LaunchRequest {
            task_ref: self.config.task_ref.clone(),
            params: unit.params.clone(),
            idempotency_key: unit.key(),
            retry_policy: self.config.retry.clone(),
            execution_timeout: self.config.execution_timeout(),
            detach_mode: self.config.detach_mode,
            parent_id: Some(parent_id.to_string()),
        }
    }

    /// Launch one child per unit concurrently and wait for every acknowledgment.
    ///
    /// Never waits for child completion. Duplicate keys within `units` are
    /// launched once; later duplicates are reported with the same handle.
    #[instrument(skip(self, units), fields(unit_count = units.len()))]
    pub async fn fan_out(&self, parent_id: &str, units: Vec<FanOutUnit>) -> FanOutReport {
        let launches = units.iter().map(|unit| {
            let request = self.request_for(parent_id, unit);
            let scheduler = Arc::clone(&self.scheduler);
            async move {
                let unit_key = request.idempotency_key.clone();
                let result = scheduler.launch(request).await;
                log_launch_result(&unit_key, &result);
                LaunchOutcome { unit_key, result }
            }
        });
        let outcomes = join_all(launches).await;

        let report = FanOutReport {
            parent_id: parent_id.to_string(),
            outcomes,
        };
        if report.all_launched() {
            info!(
                parent_id = %parent_id,
                launched = report.launched(),
                "✅ FAN_OUT: All child launches acknowledged"
            );
        } else {
            warn!(
                parent_id = %parent_id,
                launched = report.launched(),
                failed = report.failed(),
                "⚠️ FAN_OUT: Some child launches were not acknowledged"
            );
        }
        report
    }

    /// Ask `source` for the current units, then fan out over them
    pub async fn fan_out_from<U>(&self, parent_id: &str, source: &U) -> Result<FanOutReport>
    where
        U: UnitSource + ?Sized,
    {
        let units = source.next_units().await.map_err(|e| {
            ReprocessorError::LaunchError(format!("unit source failed for {parent_id}: {e}"))
        })?;
        Ok(self.fan_out(parent_id, units).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fan_out::{ChildTaskContext, DetachMode, FnChildTask, SupervisedTaskRegistry};
    use parking_lot::Mutex;

    /// Scheduler that records requests and rejects one key
    #[derive(Default)]
    struct RecordingScheduler {
        requests: Mutex<Vec<LaunchRequest>>,
        reject: Option<String>,
    }

    #[async_trait]
    impl TaskScheduler for RecordingScheduler {
        async fn launch(
            &self,
            request: LaunchRequest,
        ) -> std::result::Result<LaunchHandle, LaunchError> {
            if self.reject.as_deref() == Some(request.idempotency_key.as_str()) {
                return Err(LaunchError::Rejected {
                    key: request.idempotency_key,
                    reason: "substrate unavailable".to_string(),
                });
            }
            let handle = LaunchHandle {
                idempotency_key: request.idempotency_key.clone(),
                run_id: uuid::Uuid::new_v4(),
                launched_at: chrono::Utc::now(),
                deduplicated: false,
            };
            self.requests.lock().push(request);
            Ok(handle)
        }
    }

    #[test]
    fn test_unit_key_is_deterministic() {
        let unit = FanOutUnit::new("email_weekly_analytics", "tenant-42");
        assert_eq!(unit.key(), "email_weekly_analytics/tenant-42");
        assert_eq!(unit.key(), unit.clone().key());
    }

    #[tokio::test]
    async fn test_requests_carry_configured_policy() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let config = FanOutConfig {
            task_ref: "send_digest".to_string(),
            ..FanOutConfig::default()
        };
        let fan_out = TaskFanOut::new(scheduler.clone(), config.clone()).unwrap();

        let units = vec![
            FanOutUnit::new("digest", "t1").with_params(serde_json::json!({"tenant_id": "t1"})),
            FanOutUnit::new("digest", "t2"),
        ];
        let report = fan_out.fan_out("parent-1", units).await;
        assert_eq!(report.launched(), 2);

        let requests = scheduler.requests.lock();
        assert_eq!(requests.len(), 2);
        for request in requests.iter() {
            assert_eq!(request.task_ref, "send_digest");
            assert_eq!(request.retry_policy, config.retry);
            assert_eq!(request.execution_timeout, config.execution_timeout());
            assert_eq!(request.detach_mode, DetachMode::Abandon);
            assert_eq!(request.parent_id.as_deref(), Some("parent-1"));
        }
        assert_eq!(requests[0].params["tenant_id"], "t1");
    }

    #[tokio::test]
    async fn test_rejected_launch_does_not_affect_siblings() {
        let scheduler = Arc::new(RecordingScheduler {
            reject: Some("digest/t2".to_string()),
            ..RecordingScheduler::default()
        });
        let fan_out = TaskFanOut::new(scheduler.clone(), FanOutConfig::default()).unwrap();

        let units = ["t1", "t2", "t3"]
            .into_iter()
            .map(|tenant| FanOutUnit::new("digest", tenant))
            .collect();
        let report = fan_out.fan_out("parent-1", units).await;

        assert_eq!(report.launched(), 2);
        assert_eq!(report.failed(), 1);
        assert!(!report.all_launched());
        assert!(report.handle("digest/t1").is_some());
        assert!(report.handle("digest/t2").is_none());
        assert_eq!(scheduler.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_units_launch_once() {
        let registry = Arc::new(SupervisedTaskRegistry::new());
        registry.register(
            "process_unit",
            FnChildTask::new(|_ctx: ChildTaskContext| async { Ok(()) }),
        );
        let fan_out = TaskFanOut::new(registry.clone(), FanOutConfig::default()).unwrap();

        let report = fan_out
            .fan_out(
                "parent-1",
                vec![FanOutUnit::new("digest", "t1"), FanOutUnit::new("digest", "t1")],
            )
            .await;

        assert_eq!(report.launched(), 2);
        let deduplicated = report
            .outcomes
            .iter()
            .filter(|o| o.result.as_ref().map(|h| h.deduplicated).unwrap_or(false))
            .count();
        assert_eq!(deduplicated, 1);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let config = FanOutConfig {
            task_ref: String::new(),
            ..FanOutConfig::default()
        };
        assert!(TaskFanOut::new(scheduler, config).is_err());
    }
}
