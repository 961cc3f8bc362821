//! docq - Embedded Asynchronous Document-Parsing Task Queue
//!
//! A minimal, durable task queue that decouples expensive document parsing
//! from request/response cycles. Clients submit a file and get an opaque
//! task id back immediately; a bounded worker pool claims tasks atomically
//! from a SQLite store and runs pluggable parsing backends out of band.
//! State survives restarts, and the store tolerates out-of-process
//! maintenance tools deleting rows while the queue is live.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod queue;
pub mod store;
pub mod worker;

pub use config::QueueConfig;
pub use dispatcher::{shutdown_signal, wait_for_shutdown_signal, Dispatcher};
pub use error::QueueError;
pub use models::{CancelOutcome, NewTask, ParseResult, QueueStats, Task, TaskStatus, TaskView};
pub use queue::Queue;
pub use store::{RecoveryPolicy, TaskStore, TerminalOutcome};
pub use worker::{execute_task, BackendError, BackendRegistry, ParseRequest, ParserBackend};
