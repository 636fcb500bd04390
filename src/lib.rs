pub mod task;
pub mod retry;
pub mod cycle_check;
pub mod graph;
pub mod period;
pub mod executor;
pub mod report;
pub mod notify;
pub mod command;
pub mod store;
pub mod config;

pub use task::{FnTask, Task};
pub use retry::{Backoff, RetryExecutor, RetryOutcome, RetryPolicy};
pub use graph::{Graph, Layers};
pub use period::{ParamRules, Period, PeriodContext};
pub use executor::{RunHandle, Scheduler, SchedulerConfig};
pub use report::{RunReport, SkipReason, TaskRun, TaskState};
pub use notify::{LogNotifier, Notifier, dispatch, success_message};
pub use command::CommandTask;
pub use store::{MemoryObjectStore, ObjectStore, UploadTask};
pub use config::{PipelineConfig, TaskRegistry};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type BoxTask = Arc<dyn Task>;

/// Graph construction failures. The instance never starts when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("task {0} is declared more than once")]
    DuplicateTask(String),
    #[error("task {0} cannot depend on itself")]
    SelfDependency(String),
    #[error("unknown task {dependency} referenced by {task}")]
    UnknownTask { task: String, dependency: String },
    #[error("dependency cycle among tasks {tasks:?}")]
    Cycle { tasks: Vec<String> },
}

/// Outcome of a single failed attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Whether another attempt may follow this error under `policy`.
    pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Permanent(_) => false,
            Self::Timeout(_) => !policy.timeout_is_permanent,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid template for param {name}: {template:?}")]
    InvalidTemplate { name: String, template: String },
    #[error("task {0} has neither a `cmd` nor a registered run function")]
    MissingRunner(String),
    #[error("pipeline must declare at least one task")]
    NoTasks,
    #[error("pipeline.workers must be >= 1")]
    InvalidWorkers,
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification dispatch failed: {0}")]
    Dispatch(String),
}
