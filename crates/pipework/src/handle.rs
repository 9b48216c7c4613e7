//! Non-blocking pipeline runs.
//!
//! `run_async()` spawns the executor onto the runtime and hands back a
//! [`PipelineHandle`]. The handle resolves exactly once, with the same
//! report-or-failure `run()` would have produced. Cancelling it propagates
//! termination to every still-running stage — no orphan processes.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::builder::Pipeline;
use crate::error::PipelineError;
use crate::executor::Executor;
use crate::result::PipelineReport;

/// Handle to a pipeline running on the runtime's own tasks.
#[derive(Debug)]
pub struct PipelineHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<PipelineReport, PipelineError>>,
}

impl PipelineHandle {
    /// Request termination of every still-running stage. The handle then
    /// resolves with [`PipelineError::Cancelled`]. Idempotent; a no-op once
    /// the pipeline has finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the pipeline has completed, failed, or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the pipeline's outcome. Resolves exactly once.
    pub async fn wait(self) -> Result<PipelineReport, PipelineError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(PipelineError::Cancelled),
            Err(e) => Err(PipelineError::Internal(e.to_string())),
        }
    }
}

/// Spawn a pipeline's executor and wrap it in a handle.
pub(crate) fn spawn(pipeline: Pipeline) -> PipelineHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let join = tokio::spawn(async move { Executor::with_cancel(pipeline, token).run().await });
    PipelineHandle { cancel, join }
}

/// A handle that resolves immediately with the given error. Used for
/// configuration defects surfaced through `run_async()`.
pub(crate) fn ready(error: PipelineError) -> PipelineHandle {
    let cancel = CancellationToken::new();
    let join = tokio::spawn(async move { Err::<PipelineReport, _>(error) });
    PipelineHandle { cancel, join }
}
