//! The pinned CLI surface: `--driver`, `--timeout`, `--isolate`,
//! `--no-repeat`, `--queue-url`.

use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Launch a worker against one of the four `Driver` variants.
#[derive(Parser, Debug)]
#[command(version, about = "Durable job queue worker launcher")]
pub struct Cli {
    /// Which driver backend to run against.
    #[arg(long, value_enum)]
    pub driver: DriverKind,

    /// Poll/reserve timeout in seconds.
    #[arg(long, default_value = "5", value_parser = parse_timeout_secs)]
    pub timeout: Duration,

    /// Run each job in a subordinate process instead of in-process.
    /// Requires JOB_NAME and PROGRAM.
    #[arg(long, default_value_t = false)]
    pub isolate: bool,

    /// Process at most one job then exit, instead of polling forever.
    #[arg(long = "no-repeat", default_value_t = false)]
    pub no_repeat: bool,

    /// Connection string or filesystem path, meaning depends on --driver
    /// (postgres URL for `db`, directory for `file`, unused otherwise).
    #[arg(long)]
    pub queue_url: Option<String>,

    /// Job name to dispatch to the subordinate process. Required with
    /// --isolate.
    #[arg(value_name = "JOB_NAME")]
    pub job_name: Option<String>,

    /// Program to exec per job in isolated mode. Required with --isolate.
    #[arg(value_name = "PROGRAM")]
    pub program: Option<String>,
}

fn parse_timeout_secs(raw: &str) -> Result<Duration, String> {
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum DriverKind {
    Db,
    File,
    Memory,
    Broker,
}
