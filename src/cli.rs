use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use periodag::Period;

/// Command-line arguments for `periodag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "periodag",
    version,
    about = "Run one period of a task DAG defined in a TOML pipeline file.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the pipeline definition.
    #[arg(long, value_name = "PATH", default_value = "pipeline.toml")]
    pub config: PathBuf,

    /// Period to run, as YYYY-MM. Defaults to the last complete month.
    #[arg(long, value_name = "YYYY-MM")]
    pub period: Option<Period>,

    /// Override `[pipeline].workers`.
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Logging level. Falls back to `PERIODAG_LOG`, then `info`.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Validate the pipeline and print the graph and derived params without running anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
