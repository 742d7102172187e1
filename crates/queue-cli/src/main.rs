//! Thin launcher binary wiring the pinned CLI surface over any `Driver`
//! variant. Carries no job-handling business logic of its own: in-process
//! runs have nothing registered to dispatch to (every reserved job is an
//! `UnhandledJobType`, terminal by design), and `--isolate` delegates each
//! job to a subordinate process instead.

mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use queue_core::{QueueCore, QueueError, SignalPlugin};
use tracing_subscriber::EnvFilter;

use cli::{Cli, DriverKind};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let queue = match build_queue(&cli).await {
        Ok(queue) => queue,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            return ExitCode::from(1);
        }
    };

    match queue.run(!cli.no_repeat, cli.timeout).await {
        Ok(()) => {
            tracing::info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(QueueError::Configuration(msg)) => {
            tracing::error!(error = %msg, "configuration error");
            ExitCode::from(1)
        }
        Err(err) => {
            tracing::error!(error = %err, "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

async fn build_queue(cli: &Cli) -> anyhow::Result<Arc<QueueCore>> {
    let driver: Arc<dyn queue_core::Driver> = match cli.driver {
        DriverKind::Memory => Arc::new(queue_driver_memory::MemoryDriver::new()),
        DriverKind::File => {
            let root = cli
                .queue_url
                .as_ref()
                .context("--queue-url <dir> is required for --driver file")?;
            Arc::new(
                queue_driver_file::FileDriver::open(root.clone())
                    .await
                    .context("opening file driver directory")?,
            )
        }
        DriverKind::Db => {
            let url = cli
                .queue_url
                .as_ref()
                .context("--queue-url <postgres-url> is required for --driver db")?;
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("connecting to postgres")?;
            let driver = queue_driver_postgres::PostgresDriver::new(pool, "default");
            driver.migrate().await.context("running migrations")?;
            Arc::new(driver)
        }
        DriverKind::Broker => {
            // No broker SDK is in scope; the in-process mock transport backs
            // this variant so the CLI surface is still runnable end to end.
            Arc::new(queue_driver_broker::BrokerDriver::new(
                queue_driver_broker::MockTransport::new(),
            ))
        }
    };

    let mut builder = QueueCore::builder(driver).with_plugin(SignalPlugin::install());

    if cli.isolate {
        let name = cli
            .job_name
            .clone()
            .context("--isolate requires JOB_NAME and PROGRAM positional arguments")?;
        let program = cli
            .program
            .clone()
            .context("--isolate requires JOB_NAME and PROGRAM positional arguments")?;
        builder = builder.with_handler(name, queue_runner::isolated_handler(program));
    }

    Ok(builder.build())
}
