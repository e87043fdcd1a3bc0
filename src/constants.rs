//! # System Constants
//!
//! Default operating limits for the reprocessing loop and the task fan-out.
//! Every value here can be overridden through [`crate::config::ReprocessorConfig`].

/// Reprocessing loop defaults
pub mod reprocessing {
    /// Maximum number of work items claimed in one batch
    pub const MAX_RESULTS_TO_LOAD: usize = 10;
    /// Maximum number of concurrently in-flight processor invocations
    pub const MAX_CONCURRENT: usize = 2;
    /// Delay before re-polling after an empty claim
    pub const EMPTY_POLL_INTERVAL_MS: u64 = 1_000;
    /// First wait after a failed claim attempt
    pub const CLAIM_RETRY_INITIAL_INTERVAL_MS: u64 = 1_000;
    /// Upper bound on the wait between failed claim attempts
    pub const CLAIM_RETRY_MAXIMUM_INTERVAL_MS: u64 = 60_000;
}

/// Task fan-out defaults, matching the digest fan-out policy
pub mod fan_out {
    pub const INITIAL_INTERVAL_MS: u64 = 2_000;
    pub const MAXIMUM_INTERVAL_MS: u64 = 30_000;
    pub const BACKOFF_COEFFICIENT: f64 = 2.0;
    pub const MAXIMUM_ATTEMPTS: u32 = 10;
    /// Overall deadline for one child task, all attempts included (15 minutes)
    pub const EXECUTION_TIMEOUT_SECONDS: u64 = 15 * 60;
    /// Separator between unit kind and unit id in idempotency keys
    pub const KEY_SEPARATOR: char = '/';
    /// Window after completion during which relaunching a key is still deduplicated
    pub const COMPLETED_DEDUP_WINDOW_SECONDS: u64 = 0;
    /// How long terminal child records stay visible before they are pruned
    pub const TERMINAL_RETENTION_SECONDS: u64 = 60 * 60;
}

/// Work source defaults
pub mod work_source {
    /// Window during which a claim keeps an item from being re-selected
    pub const LEASE_SECONDS: u64 = 300;
    pub const ID_COLUMN: &str = "id";
    pub const TOUCHED_COLUMN: &str = "updated_at";
}

/// Structured log event names
pub mod events {
    pub const CYCLE_STARTED: &str = "reprocessing.cycle_started";
    pub const CYCLE_COMPLETED: &str = "reprocessing.cycle_completed";
    pub const ITEM_FAILED: &str = "reprocessing.item_failed";
    pub const CLAIM_FAILED: &str = "reprocessing.claim_failed";
    pub const CHILD_LAUNCHED: &str = "fan_out.child_launched";
    pub const CHILD_LAUNCH_FAILED: &str = "fan_out.child_launch_failed";
    pub const CHILD_COMPLETED: &str = "fan_out.child_completed";
    pub const CHILD_FAILED: &str = "fan_out.child_failed";
}
