mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use periodag::{LogNotifier, Period, PipelineConfig, TaskRegistry};
use tracing::warn;

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("periodag error: {err:?}");
            std::process::exit(2);
        }
    }
}

async fn run_main() -> Result<bool> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;

    let mut config = PipelineConfig::load(&args.config)
        .with_context(|| format!("loading pipeline from {:?}", args.config))?;
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
        config.validate()?;
    }

    let period = args
        .period
        .unwrap_or_else(|| Period::last_complete(Utc::now().date_naive()));
    let scheduler = config
        .scheduler(&TaskRegistry::new())
        .context("building pipeline graph")?
        .with_notifier(Arc::new(LogNotifier::new(config.pipeline.name.clone())));

    if args.dry_run {
        println!("{}", scheduler.graph().render_tree());
        for (name, value) in scheduler.rules().derive(period).params() {
            println!("{name} = {value}");
        }
        return Ok(true);
    }

    let handle = Arc::new(scheduler).submit_async(period);
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting running attempts finish");
            cancel.cancel();
        }
    });

    let report = handle.wait().await.context("instance aborted")?;
    println!("{}", report.to_json().context("serializing run report")?);
    Ok(report.overall_success())
}
