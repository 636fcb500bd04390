use async_trait::async_trait;
use tracing::{error, info};
use crate::{NotifyError, Period, RunReport};

/// Downstream channel told about a completed instance.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError>;
}

pub fn success_message(pipeline: &str, period: Period) -> String {
    format!("DAG {pipeline} for {period} has been successfully completed!")
}

/// Deliver `report` iff it is an overall success.
///
/// Returns whether a notification went out. A dispatch failure is logged and
/// otherwise ignored; it never changes the report.
pub async fn dispatch(notifier: &dyn Notifier, report: &RunReport) -> bool {
    if !report.overall_success() {
        info!(period = %report.period(), "instance unsuccessful, notification suppressed");
        return false;
    }

    match notifier.notify(report).await {
        Ok(()) => true,
        Err(e) => {
            error!(period = %report.period(), error = %e, "notification dispatch failed");
            false
        }
    }
}

/// Writes the success message to the log.
pub struct LogNotifier {
    pipeline: String,
}

impl LogNotifier {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError> {
        info!(
            pipeline = %self.pipeline,
            "{}",
            success_message(&self.pipeline, report.period())
        );
        Ok(())
    }
}
