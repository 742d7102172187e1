//! Isolated execution: run each job in a subordinate process instead of an
//! in-process closure.
//!
//! The payload is piped to the child's stdin as JSON; exit code 0 is
//! success, anything else (or exceeding the job's `ttr`) is a handler
//! error, which the retry policy then applies exactly as it would for an
//! in-process panic or `Err`. The subordinate receives nothing else of the
//! queue lifecycle — no queue handle, no job metadata beyond the payload.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use queue_core::JobContext;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Build a handler that runs `program` as a child process per dispatch,
/// enforcing the job's TTR as a wall-clock limit.
pub fn isolated_handler(
    program: impl Into<String>,
) -> impl Fn(JobContext) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync + 'static
{
    let program = program.into();
    move |ctx: JobContext| {
        let program = program.clone();
        Box::pin(run_isolated(program, ctx))
    }
}

async fn run_isolated(program: String, ctx: JobContext) -> anyhow::Result<()> {
    let ttr = Duration::from_secs(ctx.meta.ttr_secs.max(1));
    let payload = serde_json::to_vec(&ctx.payload)?;

    let mut child = Command::new(&program)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await?;
    }

    match tokio::time::timeout(ttr, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(anyhow::anyhow!(
            "subordinate process for job {} exited with {:?}",
            ctx.id,
            status.code()
        )),
        Ok(Err(e)) => Err(e.into()),
        Err(_elapsed) => {
            tracing::warn!(job_id = %ctx.id, ?ttr, "subordinate process exceeded ttr, killing");
            let _ = child.start_kill();
            Err(anyhow::anyhow!(
                "subordinate process for job {} exceeded ttr of {:?}",
                ctx.id,
                ttr
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_core::{AddJobOptions, JobMeta, QueueCore};
    use queue_driver_memory::MemoryDriver;
    use std::sync::Arc;
    use uuid::Uuid;

    fn dummy_ctx(queue: Arc<QueueCore>, ttr_secs: u64) -> JobContext {
        let id = Uuid::new_v4();
        let opts = AddJobOptions::new().with_ttr(ttr_secs);
        JobContext {
            id,
            name: "isolated".to_string(),
            payload: serde_json::json!({"n": 1}),
            meta: JobMeta::new(id, "isolated", &opts, chrono::Utc::now()),
            queue,
        }
    }

    fn test_queue() -> Arc<QueueCore> {
        QueueCore::builder(Arc::new(MemoryDriver::new())).build()
    }

    #[tokio::test]
    async fn successful_exit_code_is_ok() {
        let handler = isolated_handler("true");
        let result = handler(dummy_ctx(test_queue(), 5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_handler_error() {
        let handler = isolated_handler("false");
        let result = handler(dummy_ctx(test_queue(), 5)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn exceeding_ttr_kills_subordinate_and_errors() {
        // `yes` takes no arguments and runs until killed, unlike `sleep`
        // (which exits immediately with a usage error when called bare).
        let handler = isolated_handler("yes");
        let ctx = dummy_ctx(test_queue(), 1);
        let result = handler(ctx).await;
        let err = result.expect_err("subordinate outliving its ttr should be killed and error");
        assert!(
            err.to_string().contains("exceeded ttr"),
            "unexpected error: {err}"
        );
    }
}
