use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use crate::{
    BoxTask, Graph, Notifier, ParamRules, Period, PeriodContext, RetryExecutor, RetryOutcome,
    RunReport, SkipReason, TaskError, TaskRun, TaskState, dispatch,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of attempts running at once.
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Runs one instance of a [`Graph`] per period.
///
/// Layers from [`Graph::topological_layers`] are admitted one at a time; every
/// ready task of a layer is dispatched concurrently, bounded by the worker
/// pool, and the next layer starts once the whole layer has resolved.
pub struct Scheduler {
    graph: Arc<Graph>,
    rules: Arc<ParamRules>,
    workers: usize,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Scheduler {
    pub fn new(graph: Graph, rules: ParamRules, config: SchedulerConfig) -> Self {
        Self {
            graph: Arc::new(graph),
            rules: Arc::new(rules),
            workers: config.workers.max(1),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn rules(&self) -> &ParamRules {
        &self.rules
    }

    /// Run the instance for `period` to completion.
    pub async fn submit(&self, period: Period) -> RunReport {
        self.run(period, CancellationToken::new()).await
    }

    /// Start the instance for `period` in the background.
    pub fn submit_async(self: &Arc<Self>, period: Period) -> RunHandle {
        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { scheduler.run(period, token).await });
        RunHandle { period, cancel, join }
    }

    /// Run the instance for `period`, stopping early once `cancel` fires.
    ///
    /// Cancellation skips everything not yet started and lets running attempts
    /// finish. Task failures never surface as errors here; they are recorded in
    /// the returned report.
    pub async fn run(&self, period: Period, cancel: CancellationToken) -> RunReport {
        let span = info_span!("instance", period = %period);
        self.run_instance(period, cancel).instrument(span).await
    }

    async fn run_instance(&self, period: Period, cancel: CancellationToken) -> RunReport {
        let ctx = Arc::new(self.rules.derive(period));
        let workers = Arc::new(Semaphore::new(self.workers));
        let started_at = Utc::now();

        let mut runs: BTreeMap<String, TaskRun> = self
            .graph
            .task_ids()
            .map(|id| (id.to_string(), TaskRun::pending(id)))
            .collect();

        info!(tasks = self.graph.len(), workers = self.workers, "instance started");

        for layer in self.graph.topological_layers() {
            let mut handles: Vec<(String, JoinHandle<TaskRun>)> = Vec::new();

            for id in layer {
                let blocked = self
                    .graph
                    .dependencies_of(id)
                    .iter()
                    .find(|dep| {
                        runs.get(dep.as_str()).map(|run| run.state) != Some(TaskState::Succeeded)
                    })
                    .cloned();

                let (Some(mut run), Some(task)) = (runs.remove(id), self.graph.task(id).cloned())
                else {
                    continue;
                };

                if cancel.is_cancelled() {
                    run.skip(SkipReason::Cancelled);
                    runs.insert(id.to_string(), run);
                    continue;
                }
                if let Some(upstream) = blocked {
                    warn!(task = %id, upstream = %upstream, "skipped, upstream did not succeed");
                    run.skip(SkipReason::UpstreamFailed { upstream });
                    runs.insert(id.to_string(), run);
                    continue;
                }

                run.state = TaskState::Ready;
                let span = info_span!("task", task = %id);
                let handle = tokio::spawn(
                    execute_task(task, run, ctx.clone(), workers.clone(), cancel.clone())
                        .instrument(span),
                );
                handles.push((id.to_string(), handle));
            }

            let (ids, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
            for (id, joined) in ids.into_iter().zip(join_all(handles).await) {
                let run = joined.unwrap_or_else(|e| {
                    warn!(task = %id, error = %e, "task worker aborted");
                    let mut run = TaskRun::pending(id.as_str());
                    run.fail(0, format!("task worker aborted: {e}"));
                    run
                });
                runs.insert(id, run);
            }
        }

        let terminal = self.graph.terminal_tasks().into_iter().map(String::from).collect();
        let report = RunReport::finalize(period, started_at, cancel.is_cancelled(), terminal, runs);
        info!(summary = %report.summary(), "instance finished");

        if let Some(notifier) = &self.notifier {
            dispatch(notifier.as_ref(), &report).await;
        }
        report
    }
}

async fn execute_task(
    task: BoxTask,
    mut run: TaskRun,
    ctx: Arc<PeriodContext>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
) -> TaskRun {
    let retry = RetryExecutor::new(task.retry_policy());
    let id = run.task_id.clone();

    let outcome = retry
        .execute_with_retry(&cancel, &workers, &id, |attempt| {
            if run.started_at.is_none() {
                run.started_at = Some(Utc::now());
            }
            run.state = TaskState::Running;
            run.attempt = attempt;
            info!(attempt, "running");

            let (task, ctx) = (task.clone(), ctx.clone());
            async move {
                AssertUnwindSafe(task.run(&ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(TaskError::permanent(format!(
                            "task panicked: {}",
                            panic_message(&*panic)
                        )))
                    })
            }
        })
        .await;

    match outcome {
        RetryOutcome::Succeeded { attempts, .. } => {
            run.succeed(attempts);
            info!(attempts, "succeeded");
        }
        RetryOutcome::Failed { error, attempts } => {
            warn!(attempts, error = %error, "failed");
            run.fail(attempts, error.to_string());
        }
        RetryOutcome::Cancelled { attempts: 0, .. } => {
            run.skip(SkipReason::Cancelled);
        }
        RetryOutcome::Cancelled { attempts, last_error } => {
            let last = last_error.map(|e| e.to_string()).unwrap_or_default();
            warn!(attempts, "cancelled while waiting to retry");
            run.fail(attempts, format!("cancelled before retry: {last}"));
        }
    }
    run
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Background instance started by [`Scheduler::submit_async`].
pub struct RunHandle {
    period: Period,
    cancel: CancellationToken,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn period(&self) -> Period {
        self.period
    }

    /// Request cancellation; running attempts still finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<RunReport, JoinError> {
        self.join.await
    }
}
