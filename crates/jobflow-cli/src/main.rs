use std::time::Duration;

use clap::Parser;
use jobflow_core::{EngineConfig, JobOptions, LogFormat, WorkflowEngine, init_tracing};
use serde_json::json;
use tokio::time::sleep;
use tracing::info;

/// Run a batch of simulated jobs through the workflow engine and print the
/// resulting metrics and health.
#[derive(Debug, Parser)]
#[command(name = "jobflow", version)]
struct Args {
    /// Number of jobs to submit.
    #[arg(long, default_value_t = 20)]
    jobs: usize,

    /// Overrides JOBFLOW_MAX_CONCURRENCY.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Overrides JOBFLOW_DEFAULT_MAX_RETRIES.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Overrides JOBFLOW_RETRY_DELAY_BASE_MS.
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Overrides JOBFLOW_SIMULATED_STEP_DELAY_MS.
    #[arg(long)]
    step_delay_ms: Option<u64>,

    /// Every n-th job always fails (0 disables).
    #[arg(long, default_value_t = 7)]
    fail_every: usize,

    /// Every n-th job fails its first attempt, then succeeds (0 disables).
    #[arg(long, default_value_t = 3)]
    flaky_every: usize,

    #[arg(long, default_value = "json")]
    log_format: LogFormat,
}

fn every(n: usize, i: usize) -> bool {
    n != 0 && i % n == 0
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = EngineConfig::from_env()?;
    if let Some(v) = args.concurrency {
        config.queue.max_concurrency = v;
    }
    if let Some(v) = args.max_retries {
        config.queue.default_max_retries = v;
    }
    if let Some(v) = args.retry_delay_ms {
        config.queue.retry_delay_base_ms = v;
    }
    if let Some(v) = args.step_delay_ms {
        config.simulated_step_delay_ms = v;
    }
    let health_interval = config.queue.health_check_interval();

    let engine = WorkflowEngine::new(config)?;
    engine.start();
    engine.start_health_monitoring(health_interval);

    for i in 1..=args.jobs {
        let payload = json!({
            "index": i,
            "fail": every(args.fail_every, i),
            "fail_attempts": if every(args.flaky_every, i) { 1 } else { 0 },
        });
        // Spread jobs over a few priority bands.
        let priority = (i % 3) as i32;
        engine.add_job(payload, JobOptions::new().with_priority(priority));
    }
    info!(jobs = args.jobs, "jobs submitted");

    loop {
        let metrics = engine.get_queue_metrics();
        if metrics.pending + metrics.processing == 0 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    println!("{}", serde_json::to_string_pretty(&engine.get_metrics())?);
    println!("{}", serde_json::to_string_pretty(&engine.get_health_status())?);

    engine.shutdown();
    Ok(())
}
