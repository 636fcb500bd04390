use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use crate::Period;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Why a task was never attempted. Not a failure of the task itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    UpstreamFailed { upstream: String },
    Cancelled,
}

/// Execution record of one task within one DAG instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: String,
    /// Attempts made so far; 0 while pending or when skipped.
    pub attempt: u32,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Present iff `state == Failed`.
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl TaskRun {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            attempt: 0,
            state: TaskState::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            skip_reason: None,
        }
    }

    pub(crate) fn skip(&mut self, reason: SkipReason) {
        self.state = TaskState::Skipped;
        self.skip_reason = Some(reason);
    }

    pub(crate) fn succeed(&mut self, attempts: u32) {
        self.attempt = attempts;
        self.state = TaskState::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, attempts: u32, error: impl Into<String>) {
        self.attempt = attempts;
        self.state = TaskState::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        (end - start).to_std().ok()
    }
}

/// Aggregate result of one DAG instance; the single source of truth for its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    period: Period,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    cancelled: bool,
    terminal_tasks: Vec<String>,
    task_runs: BTreeMap<String, TaskRun>,
    overall_success: bool,
}

impl RunReport {
    pub(crate) fn finalize(
        period: Period,
        started_at: DateTime<Utc>,
        cancelled: bool,
        terminal_tasks: Vec<String>,
        task_runs: BTreeMap<String, TaskRun>,
    ) -> Self {
        let overall_success = terminal_tasks.iter().all(|id| {
            task_runs
                .get(id)
                .is_some_and(|run| run.state == TaskState::Succeeded)
        });

        Self {
            period,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            terminal_tasks,
            task_runs,
            overall_success,
        }
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn overall_success(&self) -> bool {
        self.overall_success
    }

    pub fn terminal_tasks(&self) -> &[String] {
        &self.terminal_tasks
    }

    pub fn task_runs(&self) -> &BTreeMap<String, TaskRun> {
        &self.task_runs
    }

    pub fn task(&self, id: &str) -> Option<&TaskRun> {
        self.task_runs.get(id)
    }

    pub fn state_of(&self, id: &str) -> Option<TaskState> {
        self.task(id).map(|run| run.state)
    }

    pub fn ids_in(&self, state: TaskState) -> Vec<&str> {
        self.task_runs
            .values()
            .filter(|run| run.state == state)
            .map(|run| run.task_id.as_str())
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn summary(&self) -> String {
        let count = |state| self.ids_in(state).len();
        format!(
            "{}: {} ({} succeeded, {} failed, {} skipped)",
            self.period,
            if self.overall_success { "success" } else { "failure" },
            count(TaskState::Succeeded),
            count(TaskState::Failed),
            count(TaskState::Skipped),
        )
    }
}
