//! # Reprocessing
//!
//! Claim batches of stale work from a [`WorkSource`], hand each item to a
//! [`Processor`] under a concurrency ceiling, and repeat.

pub mod pg_work_source;
pub mod processor;
pub mod reprocessing_loop;
pub mod work_source;

pub use pg_work_source::PgWorkSource;
pub use processor::{FnProcessor, ItemOutcome, ProcessingFailure, Processor};
pub use reprocessing_loop::{CycleSummary, LoopReport, LoopState, ReprocessingLoop};
pub use work_source::{ClaimError, InMemoryWorkSource, WorkItemId, WorkSource};
