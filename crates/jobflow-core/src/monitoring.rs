//! Health verdicts and metrics snapshots derived from the queue and the
//! worker pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::config::MonitoringConfig;
use crate::domain::JobData;
use crate::observability::{Logger, log_event};
use crate::queue::{Queue, QueueMetrics};
use crate::worker::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// A failed health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthIssue {
    QueueBacklog { size: usize, limit: usize },
    NoActiveWorkers,
    FailureRate { rate: f64, limit: f64 },
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthIssue::QueueBacklog { size, limit } => {
                write!(f, "queue backlog {size} reached limit {limit}")
            }
            HealthIssue::NoActiveWorkers => f.write_str("no active workers"),
            HealthIssue::FailureRate { rate, limit } => {
                write!(f, "failure rate {rate:.3} reached limit {limit:.3}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    /// Pending jobs.
    pub queue_size: usize,
    pub active_workers: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub uptime_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<HealthIssue>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }

    /// Human readable description of each failed check.
    pub fn reasons(&self) -> Vec<String> {
        self.issues.iter().map(ToString::to_string).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Sum of the four state counts at collection time.
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub average_processing_time_ms: f64,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub timestamp: DateTime<Utc>,
}

/// Failed checks for the given counts. Empty means healthy.
fn assess(counts: &QueueMetrics, active_workers: usize, config: &MonitoringConfig) -> Vec<HealthIssue> {
    let mut issues = Vec::new();

    if counts.pending >= config.max_queue_size {
        issues.push(HealthIssue::QueueBacklog {
            size: counts.pending,
            limit: config.max_queue_size,
        });
    }
    if active_workers == 0 {
        issues.push(HealthIssue::NoActiveWorkers);
    }

    // No terminal jobs yet: the rate is undefined and the check passes.
    let terminal = counts.completed + counts.failed;
    if terminal > 0 {
        let rate = counts.failed as f64 / terminal as f64;
        if rate >= config.max_failure_rate {
            issues.push(HealthIssue::FailureRate {
                rate,
                limit: config.max_failure_rate,
            });
        }
    }

    issues
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, value: T, capacity: usize) {
    buffer.push_back(value);
    while buffer.len() > capacity {
        buffer.pop_front();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MonitoringService<P: JobData, R: JobData> {
    queue: Queue<P, R>,
    workers: Arc<WorkerPool<P, R>>,
    config: MonitoringConfig,
    logger: Logger,
    started: Instant,
    /// Rolling window of processing times (ms).
    samples: Mutex<VecDeque<f64>>,
    history: Mutex<VecDeque<Metrics>>,
}

impl<P: JobData, R: JobData> MonitoringService<P, R> {
    pub fn new(
        queue: Queue<P, R>,
        workers: Arc<WorkerPool<P, R>>,
        config: MonitoringConfig,
        logger: Logger,
    ) -> Self {
        Self {
            queue,
            workers,
            config,
            logger,
            started: Instant::now(),
            samples: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let counts = self.queue.get_metrics();
        let active_workers = self.workers.get_active_worker_count();
        let issues = assess(&counts, active_workers, &self.config);

        HealthStatus {
            status: if issues.is_empty() {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            },
            queue_size: counts.pending,
            active_workers,
            completed_jobs: counts.completed,
            failed_jobs: counts.failed,
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            issues,
        }
    }

    /// Collect a snapshot and append it to the history.
    pub fn get_metrics(&self) -> Metrics {
        let counts = self.queue.get_metrics();
        let metrics = Metrics {
            total_jobs: counts.pending + counts.processing + counts.completed + counts.failed,
            completed_jobs: counts.completed,
            failed_jobs: counts.failed,
            average_processing_time_ms: self.average_processing_time_ms(),
            queue_depth: counts.pending,
            active_workers: self.workers.get_active_worker_count(),
            timestamp: Utc::now(),
        };

        push_bounded(
            &mut lock(&self.history),
            metrics.clone(),
            self.config.history_capacity,
        );
        metrics
    }

    pub fn record_processing_time(&self, ms: f64) {
        push_bounded(&mut lock(&self.samples), ms, self.config.sample_capacity);
    }

    /// Mean of the retained samples, 0 when there are none.
    pub fn average_processing_time_ms(&self) -> f64 {
        let samples = lock(&self.samples);
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    /// Retained snapshots, oldest first.
    pub fn history(&self) -> Vec<Metrics> {
        lock(&self.history).iter().cloned().collect()
    }

    fn run_health_check(&self) {
        let health = self.get_health_status();
        let metrics = self.get_metrics();

        if health.is_healthy() {
            log_event!(
                Level::INFO,
                self.logger,
                "health check passed",
                queue_size = health.queue_size,
                active_workers = health.active_workers,
                total_jobs = metrics.total_jobs,
                average_processing_time_ms = metrics.average_processing_time_ms
            );
        } else {
            log_event!(
                Level::WARN,
                self.logger,
                "health check failed",
                queue_size = health.queue_size,
                active_workers = health.active_workers,
                completed_jobs = health.completed_jobs,
                failed_jobs = health.failed_jobs,
                issues = %health.reasons().join("; ")
            );
        }
    }

    /// Run a health check every `interval` on a background task until the
    /// returned handle is stopped or dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_periodic_health_check(self: &Arc<Self>, interval: Duration) -> HealthCheckHandle {
        let token = CancellationToken::new();
        let stop = token.clone();
        let service = Arc::clone(self);
        let period = interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => service.run_health_check(),
                }
            }
        });

        HealthCheckHandle { token, join }
    }
}

/// Owns a periodic health check task. Dropping it stops the task.
pub struct HealthCheckHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl HealthCheckHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

impl Drop for HealthCheckHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::domain::{Job, JobOptions};
    use crate::ports::{JobContext, JobProcessor};
    use crate::worker::WorkerOptions;
    use async_trait::async_trait;
    use rstest::rstest;

    struct Echo;

    #[async_trait]
    impl JobProcessor<u32, u32> for Echo {
        async fn process(&self, job: Job<u32, u32>, _ctx: JobContext) -> anyhow::Result<u32> {
            Ok(job.payload)
        }
    }

    fn service(config: MonitoringConfig) -> MonitoringService<u32, u32> {
        MonitoringService::new(
            Queue::new(QueueConfig::default()),
            Arc::new(WorkerPool::new()),
            config,
            Logger::new("test"),
        )
    }

    fn counts(pending: usize, completed: usize, failed: usize) -> QueueMetrics {
        QueueMetrics {
            pending,
            processing: 0,
            completed,
            failed,
            total: pending + completed + failed,
        }
    }

    #[rstest]
    #[case::idle(counts(0, 0, 0), 1, vec![])]
    #[case::below_threshold(counts(10, 91, 9), 1, vec![])]
    #[case::rate_at_threshold(
        counts(0, 9, 1),
        1,
        vec![HealthIssue::FailureRate { rate: 0.1, limit: 0.1 }]
    )]
    #[case::backlog(
        counts(1_000, 0, 0),
        2,
        vec![HealthIssue::QueueBacklog { size: 1_000, limit: 1_000 }]
    )]
    #[case::no_workers(counts(0, 0, 0), 0, vec![HealthIssue::NoActiveWorkers])]
    fn assess_flags_each_failed_check(
        #[case] counts: QueueMetrics,
        #[case] active_workers: usize,
        #[case] expected: Vec<HealthIssue>,
    ) {
        assert_eq!(
            assess(&counts, active_workers, &MonitoringConfig::default()),
            expected
        );
    }

    #[tokio::test]
    async fn zero_workers_is_unhealthy() {
        let monitoring = service(MonitoringConfig::default());

        let health = monitoring.get_health_status();
        assert_eq!(health.status, HealthState::Unhealthy);
        assert_eq!(health.active_workers, 0);
        assert_eq!(health.reasons(), vec!["no active workers".to_string()]);
    }

    #[tokio::test]
    async fn started_worker_makes_idle_engine_healthy() {
        let monitoring = service(MonitoringConfig::default());
        monitoring
            .workers
            .create_worker(WorkerOptions::new("w", 1), Arc::new(Echo))
            .unwrap()
            .start();

        let health = monitoring.get_health_status();
        assert!(health.is_healthy());
        assert!(health.issues.is_empty());
    }

    #[tokio::test]
    async fn metrics_reflect_queue_counts_and_fill_history() {
        let monitoring = service(MonitoringConfig {
            history_capacity: 2,
            ..MonitoringConfig::default()
        });
        monitoring.queue.add(1, JobOptions::new());
        monitoring.queue.add(2, JobOptions::new());

        let metrics = monitoring.get_metrics();
        assert_eq!(metrics.total_jobs, 2);
        assert_eq!(metrics.queue_depth, 2);
        assert_eq!(metrics.average_processing_time_ms, 0.0);

        monitoring.get_metrics();
        monitoring.queue.add(3, JobOptions::new());
        monitoring.get_metrics();

        let history = monitoring.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].total_jobs, 3);
    }

    #[test]
    fn processing_time_window_evicts_oldest() {
        let monitoring = service(MonitoringConfig {
            sample_capacity: 3,
            ..MonitoringConfig::default()
        });

        for ms in [100.0, 10.0, 20.0, 30.0] {
            monitoring.record_processing_time(ms);
        }
        assert_eq!(monitoring.average_processing_time_ms(), 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_check_collects_until_stopped() {
        let monitoring = Arc::new(service(MonitoringConfig::default()));
        let handle = monitoring.start_periodic_health_check(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(monitoring.history().len(), 3);
        assert!(handle.is_running());

        handle.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(monitoring.history().len(), 3);
        assert!(!handle.is_running());
    }
}
