//! JobProcessor port - ジョブを実際に処理する外部関数

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{Job, JobData, JobId};

/// Executes one attempt of a job.
///
/// Errors are opaque to the queue: they are only counted and recorded as
/// `JobFailure { message }`. A panic inside `process` is treated the same way.
#[async_trait]
pub trait JobProcessor<P: JobData, R: JobData>: Send + Sync {
    async fn process(&self, job: Job<P, R>, ctx: JobContext) -> anyhow::Result<R>;
}

/// Per-attempt context handed to the processor.
///
/// The queue races the processor against the cancellation token, so a
/// processor that ignores it is still cut off; checking it lets a processor
/// stop cleanly between steps.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    token: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: JobId, token: CancellationToken) -> Self {
        Self { job_id, token }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the attempt has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
