//! # Fan-Out
//!
//! Detached child tasks, one per independent unit, each with its own retry
//! policy, execution deadline and detach mode.

pub mod registry;
pub mod scheduler;
pub mod task_fan_out;

pub use registry::{ChildSnapshot, SupervisedTaskRegistry};
pub use scheduler::{
    ChildTask, ChildTaskContext, ChildTaskError, ChildTaskStatus, DetachMode, FnChildTask,
    LaunchError, LaunchHandle, LaunchRequest, TaskScheduler,
};
pub use task_fan_out::{FanOutReport, FanOutUnit, LaunchOutcome, TaskFanOut, UnitSource};
