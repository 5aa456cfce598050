//! Built-in processor that simulates a multi-step workflow.

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::Level;

use crate::domain::Job;
use crate::observability::{Logger, log_event};
use crate::ports::{JobContext, JobProcessor};

const STEPS: [&str; 3] = ["validate", "process", "finalize"];

/// Runs `validate`, `process` and `finalize`, sleeping `step_delay` in each.
///
/// Payload switches:
/// - `"fail": true` fails every attempt in the `process` step.
/// - `"fail_attempts": n` fails the first `n` attempts, then succeeds.
pub struct SimulatedWorkflow {
    step_delay: Duration,
    logger: Logger,
}

impl SimulatedWorkflow {
    pub fn new(step_delay: Duration, logger: Logger) -> Self {
        Self { step_delay, logger }
    }
}

fn should_fail(job: &Job<Value, Value>) -> bool {
    if job.payload.get("fail").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    job.payload
        .get("fail_attempts")
        .and_then(Value::as_u64)
        .is_some_and(|n| u64::from(job.retry_count) < n)
}

#[async_trait]
impl JobProcessor<Value, Value> for SimulatedWorkflow {
    async fn process(&self, job: Job<Value, Value>, ctx: JobContext) -> anyhow::Result<Value> {
        let log = self.logger.with_correlation(job.id);
        let attempt = job.attempt();
        let mut completed = Vec::with_capacity(STEPS.len());

        for step in STEPS {
            log_event!(Level::INFO, log, "step started", step, attempt);

            tokio::select! {
                _ = ctx.cancelled() => bail!("cancelled during step {step}"),
                _ = tokio::time::sleep(self.step_delay) => {}
            }

            if step == "process" && should_fail(&job) {
                bail!("simulated failure in step {step}");
            }
            completed.push(step);
        }

        Ok(json!({ "steps": completed, "attempt": attempt }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobId;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use ulid::Ulid;

    fn run_args(payload: Value, retry_count: u32) -> (Job<Value, Value>, JobContext, CancellationToken) {
        let id = JobId::from_ulid(Ulid::new());
        let mut job = Job::new(id, payload, 0, 5, Utc::now());
        job.retry_count = retry_count;
        let token = CancellationToken::new();
        (job, JobContext::new(id, token.clone()), token)
    }

    fn workflow() -> SimulatedWorkflow {
        SimulatedWorkflow::new(Duration::from_millis(10), Logger::new("test"))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_every_step() {
        let (job, ctx, _) = run_args(json!({ "n": 1 }), 0);

        let result = workflow().process(job, ctx).await.unwrap();
        assert_eq!(
            result,
            json!({ "steps": ["validate", "process", "finalize"], "attempt": 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fail_flag_fails_in_process_step() {
        let (job, ctx, _) = run_args(json!({ "fail": true }), 0);

        let err = workflow().process(job, ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "simulated failure in step process");
    }

    #[tokio::test(start_paused = true)]
    async fn fail_attempts_succeeds_once_exhausted() {
        let (job, ctx, _) = run_args(json!({ "fail_attempts": 2 }), 1);
        assert!(workflow().process(job, ctx).await.is_err());

        let (job, ctx, _) = run_args(json!({ "fail_attempts": 2 }), 2);
        let result = workflow().process(job, ctx).await.unwrap();
        assert_eq!(result["attempt"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_cancelled() {
        let (job, ctx, token) = run_args(json!({}), 0);
        token.cancel();

        let err = workflow().process(job, ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "cancelled during step validate");
    }
}
