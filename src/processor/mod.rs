//! Task Execution Subsystem
//!
//! The persistent queue of per-file sub-tasks and everything that drains it:
//! the worker-pool processor, its two handler classes, the retry and
//! recovery services, and the lifecycle actions.

pub mod actions;
pub mod engine;
pub mod model;
pub mod progress;
pub mod recovery;
pub mod retry_service;
pub mod runner;
pub mod task_log;

pub use model::{ProcessKind, SubTask, SubTaskStatus, Task, TaskStatus};
pub use recovery::RecoveryService;
pub use retry_service::RetryService;
pub use runner::Processor;
