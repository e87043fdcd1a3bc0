#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Reprocessor Core
//!
//! Bounded-concurrency claim-and-dispatch reprocessing of deferred work, plus
//! fan-out of detached child tasks with their own retry policy.
//!
//! ## Overview
//!
//! A [`ReprocessingLoop`](reprocessing::ReprocessingLoop) repeatedly claims a
//! batch of stale items from a [`WorkSource`](reprocessing::WorkSource),
//! dispatches each one to a [`Processor`](reprocessing::Processor) while an
//! [`AdmissionController`](admission::AdmissionController) caps the number of
//! concurrent invocations, waits for the batch to drain, then claims again.
//!
//! A [`TaskFanOut`](fan_out::TaskFanOut) launches one child task per
//! independent unit through a [`TaskScheduler`](fan_out::TaskScheduler) and
//! returns once every launch is acknowledged. Children outlive the parent.
//!
//! ## Module Organization
//!
//! - [`admission`] - Semaphore-backed admission ceiling
//! - [`reprocessing`] - Work sources, processor seam and the reprocessing loop
//! - [`fan_out`] - Scheduler seam, supervised task registry and fan-out
//! - [`retry_policy`] - Exponential backoff shared by claims and children
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup and per-cycle/per-child records
//! - [`shutdown`] - Cooperative shutdown signal
//! - [`error`] - Crate error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reprocessor_core::config::ConfigManager;
//! use reprocessor_core::reprocessing::{
//!     FnProcessor, InMemoryWorkSource, ReprocessingLoop, WorkItemId,
//! };
//! use reprocessor_core::shutdown::shutdown_channel;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let source = Arc::new(InMemoryWorkSource::with_items(["r-1", "r-2"]));
//! let processor = Arc::new(FnProcessor::new(|item: WorkItemId| async move {
//!     println!("reprocessing {item}");
//!     Ok(())
//! }));
//!
//! let reprocessing =
//!     ReprocessingLoop::new(source, processor, manager.config().reprocessing.clone())?;
//! let (shutdown, signal) = shutdown_channel();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.trigger();
//! });
//! let report = reprocessing.run(signal).await?;
//! println!("processed {} items", report.total_success);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod constants;
pub mod error;
pub mod fan_out;
pub mod logging;
pub mod reprocessing;
pub mod retry_policy;
pub mod shutdown;

pub use admission::{AdmissionController, AdmissionPermit};
pub use config::{ConfigManager, ConfigurationError, ReprocessorConfig};
pub use error::{ReprocessorError, Result};
pub use fan_out::{
    ChildTask, DetachMode, FanOutUnit, LaunchError, LaunchHandle, SupervisedTaskRegistry,
    TaskFanOut, TaskScheduler,
};
pub use reprocessing::{
    InMemoryWorkSource, ProcessingFailure, Processor, ReprocessingLoop, WorkItemId, WorkSource,
};
pub use retry_policy::RetryPolicy;
pub use shutdown::{shutdown_channel, ShutdownHandle, ShutdownSignal};
