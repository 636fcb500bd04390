//! TOML pipeline definitions.
//!
//! ```toml
//! [pipeline]
//! name = "nyc_taxi"
//! workers = 4
//!
//! [defaults]
//! max_retries = 1
//! retry_delay_secs = 300
//!
//! [params]
//! dataset_file = "green_tripdata_%Y-%m.parquet"
//!
//! [task.download_dataset]
//! cmd = "curl -o /tmp/{dataset_file} https://example.org/{dataset_file}"
//!
//! [task.load_to_store]
//! depends_on = ["download_dataset"]
//! ```
//!
//! Tasks with a `cmd` run as shell commands; every other task takes its run
//! function from a [`TaskRegistry`]. A registered function wins over `cmd`.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use crate::task::RunFn;
use crate::{
    BoxTask, CommandTask, ConfigError, FnTask, Graph, ParamRules, PeriodContext, RetryPolicy,
    Scheduler, SchedulerConfig, TaskError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub defaults: TaskDefaults,
    /// Param name to strftime template.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    pub name: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Applied to every task unless the task overrides the field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDefaults {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub timeout_is_permanent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub cmd: Option<String>,
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub permanent_exit_codes: Vec<i32>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub timeout_is_permanent: Option<bool>,
}

fn default_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay_secs() -> u64 {
    300
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            timeout_secs: None,
            timeout_is_permanent: false,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not need run functions. Graph shape is
    /// checked when the graph is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task.is_empty() {
            return Err(ConfigError::NoTasks);
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::InvalidWorkers);
        }
        self.param_rules()?;
        Ok(())
    }

    pub fn param_rules(&self) -> Result<ParamRules, ConfigError> {
        ParamRules::new(self.params.clone())
    }

    pub fn retry_policy(&self, task: &TaskConfig) -> RetryPolicy {
        let d = &self.defaults;
        RetryPolicy {
            max_retries: task.max_retries.unwrap_or(d.max_retries),
            retry_delay: Duration::from_secs(task.retry_delay_secs.unwrap_or(d.retry_delay_secs)),
            timeout: task.timeout_secs.or(d.timeout_secs).map(Duration::from_secs),
            timeout_is_permanent: task.timeout_is_permanent.unwrap_or(d.timeout_is_permanent),
            ..RetryPolicy::default()
        }
    }

    pub fn build_graph(&self, registry: &TaskRegistry) -> Result<Graph, ConfigError> {
        let mut tasks: Vec<BoxTask> = Vec::with_capacity(self.task.len());

        for (id, cfg) in &self.task {
            let policy = self.retry_policy(cfg);
            let deps = cfg.depends_on.iter().cloned();

            let task: BoxTask = match (registry.get(id), &cfg.cmd) {
                (Some(run), _) => Arc::new(
                    FnTask::from_shared(id.clone(), run)
                        .depends_on(deps)
                        .with_policy(policy),
                ),
                (None, Some(cmd)) => {
                    let mut task = CommandTask::new(id.clone(), cmd.clone())
                        .depends_on(deps)
                        .with_policy(policy)
                        .permanent_exit_codes(cfg.permanent_exit_codes.iter().copied());
                    if let Some(dir) = &cfg.workdir {
                        task = task.workdir(dir.clone());
                    }
                    Arc::new(task)
                }
                (None, None) => return Err(ConfigError::MissingRunner(id.clone())),
            };
            tasks.push(task);
        }

        for id in registry.ids().filter(|id| !self.task.contains_key(*id)) {
            debug!(task = %id, "registered run function has no task in config");
        }

        Ok(Graph::new(tasks)?)
    }

    pub fn scheduler(&self, registry: &TaskRegistry) -> Result<Scheduler, ConfigError> {
        let graph = self.build_graph(registry)?;
        let config = SchedulerConfig {
            workers: self.pipeline.workers,
        };
        Ok(Scheduler::new(graph, self.param_rules()?, config))
    }
}

/// Run functions supplied by the embedding program, keyed by task id.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    runners: HashMap<String, Arc<RunFn>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(mut self, id: impl Into<String>, run: F) -> Self
    where
        F: Fn(PeriodContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let run: Arc<RunFn> = Arc::new(move |ctx: PeriodContext| Box::pin(run(ctx)) as BoxFuture<'static, _>);
        self.runners.insert(id.into(), run);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<RunFn>> {
        self.runners.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }
}
