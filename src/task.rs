use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use crate::{PeriodContext, RetryPolicy, TaskError};

/// A named unit of work inside a [`crate::Graph`].
///
/// `run` may be invoked more than once for the same `(id, period)`, either by the
/// retry loop or by an operator re-running the period. Implementations must
/// converge to the state a single successful invocation would leave behind:
/// overwrite by a key derived from the period, never blind-append.
#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> &str;
    fn dependencies(&self) -> Vec<String>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn run(&self, ctx: &PeriodContext) -> Result<(), TaskError>;
}

pub type RunFn = dyn Fn(PeriodContext) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync;

/// Task backed by a closure. The closure captures whatever collaborator handles
/// it needs (storage client, job submitter) at construction time.
pub struct FnTask {
    id: String,
    deps: Vec<String>,
    policy: RetryPolicy,
    run: Arc<RunFn>,
}

impl FnTask {
    pub fn new<F, Fut>(id: impl Into<String>, run: F) -> Self
    where
        F: Fn(PeriodContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let run: Arc<RunFn> = Arc::new(move |ctx: PeriodContext| Box::pin(run(ctx)) as BoxFuture<'static, _>);
        Self::from_shared(id, run)
    }

    /// Build around a run function shared with other tasks or a registry.
    pub fn from_shared(id: impl Into<String>, run: Arc<RunFn>) -> Self {
        Self {
            id: id.into(),
            deps: Vec::new(),
            policy: RetryPolicy::default(),
            run,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.policy.max_retries = max_retries;
        self.policy.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Task for FnTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy.clone()
    }

    async fn run(&self, ctx: &PeriodContext) -> Result<(), TaskError> {
        (self.run)(ctx.clone()).await
    }
}
