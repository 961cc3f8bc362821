//! Data model: tasks, lifecycle statuses, result payloads, and aggregates.

mod stats;
mod task;

pub use stats::QueueStats;
pub use task::{CancelOutcome, NewTask, ParseResult, Task, TaskStatus, TaskView};
