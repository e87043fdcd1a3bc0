//! # Structured Logging Module
//!
//! Environment-aware structured logging for the reprocessing loop and the
//! fan-out. The loop and the scheduler report exclusively through these records:
//! one summary per drain cycle and one record per child launch and child outcome.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::constants::events;
use crate::fan_out::{ChildTaskStatus, LaunchError, LaunchHandle};
use crate::reprocessing::CycleSummary;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_structured_logging(config: &LoggingConfig, environment: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let directive = config.level_for(environment);
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

        let layer = match config.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed(),
        };

        // A subscriber may already be installed by the embedding process
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            format = ?config.format,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Per-cycle record: `{batch_size, success_count, error_count}`
pub fn log_cycle_summary(summary: &CycleSummary) {
    tracing::info!(
        event = events::CYCLE_COMPLETED,
        cycle = summary.cycle,
        batch_size = summary.batch_size,
        success_count = summary.success_count,
        error_count = summary.error_count,
        not_dispatched = summary.not_dispatched,
        interrupted = summary.interrupted,
        timestamp = %Utc::now().to_rfc3339(),
        "🔁 CYCLE: Processed {} items successfully and {} with errors",
        summary.success_count,
        summary.error_count
    );
}

/// Per-child record: `{unit_key, launch_result}`
pub fn log_launch_result(unit_key: &str, result: &Result<LaunchHandle, LaunchError>) {
    match result {
        Ok(handle) => tracing::info!(
            event = events::CHILD_LAUNCHED,
            unit_key = %unit_key,
            run_id = %handle.run_id,
            deduplicated = handle.deduplicated,
            launch_result = "launched",
            "🚀 FAN_OUT: Child task launched"
        ),
        Err(error) => tracing::error!(
            event = events::CHILD_LAUNCH_FAILED,
            unit_key = %unit_key,
            launch_result = "failed",
            error = %error,
            "❌ FAN_OUT: Child task launch failed"
        ),
    }
}

/// Terminal outcome of a detached child task
pub fn log_child_terminal(unit_key: &str, status: &ChildTaskStatus) {
    match status {
        ChildTaskStatus::Completed { attempts } => tracing::info!(
            event = events::CHILD_COMPLETED,
            unit_key = %unit_key,
            attempts = attempts,
            "✅ FAN_OUT: Child task completed"
        ),
        other => tracing::warn!(
            event = events::CHILD_FAILED,
            unit_key = %unit_key,
            status = ?other,
            "⚠️ FAN_OUT: Child task ended without completing"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reprocessing::CycleSummary;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::Arc;
    use uuid::Uuid;

    /// In-memory writer for the JSON formatter
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_records(emit: impl FnOnce()) -> Vec<Value> {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = fmt()
            .json()
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, emit);

        let bytes = captured.0.lock().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_initialization_is_idempotent() {
        let config = LoggingConfig {
            level: Some("warn".to_string()),
            format: LogFormat::Json,
        };
        init_structured_logging(&config, "test");
        init_structured_logging(&LoggingConfig::default(), "production");
        assert!(LOGGER_INITIALIZED.get().is_some());
    }

    #[test]
    fn test_cycle_summary_record_fields() {
        let records = capture_records(|| {
            log_cycle_summary(&CycleSummary {
                cycle: 1,
                batch_size: 7,
                success_count: 6,
                error_count: 1,
                ..CycleSummary::default()
            })
        });

        assert_eq!(records.len(), 1);
        let fields = &records[0]["fields"];
        assert_eq!(records[0]["level"], "INFO");
        assert_eq!(fields["event"], events::CYCLE_COMPLETED);
        assert_eq!(fields["batch_size"], 7);
        assert_eq!(fields["success_count"], 6);
        assert_eq!(fields["error_count"], 1);
    }

    #[test]
    fn test_launch_result_records_fields() {
        let handle = LaunchHandle {
            idempotency_key: "digest/t1".to_string(),
            run_id: Uuid::new_v4(),
            launched_at: Utc::now(),
            deduplicated: false,
        };
        let run_id = handle.run_id.to_string();

        let records = capture_records(|| {
            log_launch_result("digest/t1", &Ok(handle));
            log_launch_result(
                "digest/t2",
                &Err(LaunchError::UnknownTask("digest".to_string())),
            );
        });

        assert_eq!(records.len(), 2);
        let launched = &records[0]["fields"];
        assert_eq!(launched["unit_key"], "digest/t1");
        assert_eq!(launched["launch_result"], "launched");
        assert_eq!(launched["run_id"], run_id.as_str());
        assert_eq!(launched["deduplicated"], false);

        assert_eq!(records[1]["level"], "ERROR");
        let failed = &records[1]["fields"];
        assert_eq!(failed["unit_key"], "digest/t2");
        assert_eq!(failed["launch_result"], "failed");
        assert_eq!(failed["error"], "no child task registered for 'digest'");
    }

    #[test]
    fn test_child_terminal_records_by_outcome() {
        let records = capture_records(|| {
            log_child_terminal("digest/t1", &ChildTaskStatus::Completed { attempts: 1 });
            log_child_terminal("digest/t2", &ChildTaskStatus::TimedOut { attempts: 5 });
        });

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["level"], "INFO");
        assert_eq!(records[0]["fields"]["event"], events::CHILD_COMPLETED);
        assert_eq!(records[0]["fields"]["attempts"], 1);
        assert_eq!(records[1]["level"], "WARN");
        assert_eq!(records[1]["fields"]["event"], events::CHILD_FAILED);
        assert_eq!(records[1]["fields"]["unit_key"], "digest/t2");
    }
}
