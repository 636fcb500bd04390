use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use crate::{PeriodContext, RetryPolicy, Task, TaskError};

/// Shell command task. `{param}` placeholders are filled from the period's
/// derived params before the command is spawned.
///
/// A non-zero exit is transient unless the code is listed in
/// `permanent_exit_codes`; failing to spawn at all is permanent.
#[derive(Debug, Clone)]
pub struct CommandTask {
    id: String,
    deps: Vec<String>,
    policy: RetryPolicy,
    cmd: String,
    permanent_exit_codes: Vec<i32>,
    workdir: Option<PathBuf>,
}

impl CommandTask {
    pub fn new(id: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deps: Vec::new(),
            policy: RetryPolicy::default(),
            cmd: cmd.into(),
            permanent_exit_codes: Vec::new(),
            workdir: None,
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

    pub fn permanent_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.permanent_exit_codes = codes.into_iter().collect();
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    fn shell(&self, line: &str) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(line);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(line);
            c
        };
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Task for CommandTask {
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
        let line = ctx.render(&self.cmd)?;
        info!(task = %self.id, cmd = %line, "spawning command");

        let output = self
            .shell(&line)
            .env("PERIODAG_PERIOD", ctx.period().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TaskError::permanent(format!("spawning `{line}`: {e}")))?;

        for l in String::from_utf8_lossy(&output.stderr).lines() {
            debug!(task = %self.id, "stderr: {}", l);
        }

        if output.status.success() {
            return Ok(());
        }

        let code = output.status.code().unwrap_or(-1);
        let reason = format!("`{line}` exited with status {code}");
        if self.permanent_exit_codes.contains(&code) {
            Err(TaskError::Permanent(reason))
        } else {
            Err(TaskError::Transient(reason))
        }
    }
}
