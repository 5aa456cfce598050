//! WorkflowEngine: queue, worker pool, monitoring and logging wired together.
//!
//! Job flow:
//! 1. `add_job` stores the job in the queue
//! 2. the queue dispatches it to `PooledProcessor`
//! 3. `PooledProcessor` reserves a worker and runs the engine's processor
//!    through it, so worker in-flight counts are real
//! 4. `JobLogSink` logs every transition and feeds completed turnaround
//!    times to monitoring

mod simulated;

pub use simulated::SimulatedWorkflow;

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{Level, debug};

use crate::config::EngineConfig;
use crate::domain::{Job, JobData, JobId, JobOptions, JobState, QueueEvent};
use crate::error::EngineError;
use crate::monitoring::{HealthCheckHandle, HealthStatus, Metrics, MonitoringService};
use crate::observability::{Logger, log_event};
use crate::ports::{EventSink, JobContext, JobProcessor};
use crate::queue::{Queue, QueueMetrics};
use crate::worker::{WorkerOptions, WorkerPool};

/// Id of the worker registered by the engine itself.
pub const DEFAULT_WORKER_ID: &str = "default";

type ProcessorSlot<P, R> = RwLock<Arc<dyn JobProcessor<P, R>>>;

fn current<P: JobData, R: JobData>(slot: &ProcessorSlot<P, R>) -> Arc<dyn JobProcessor<P, R>> {
    Arc::clone(&*slot.read().unwrap_or_else(PoisonError::into_inner))
}

/// Delegates to whichever processor the engine currently holds.
struct SlotProcessor<P: JobData, R: JobData> {
    slot: Arc<ProcessorSlot<P, R>>,
}

#[async_trait]
impl<P: JobData, R: JobData> JobProcessor<P, R> for SlotProcessor<P, R> {
    async fn process(&self, job: Job<P, R>, ctx: JobContext) -> anyhow::Result<R> {
        let processor = current(&self.slot);
        processor.process(job, ctx).await
    }
}

/// Queue-side processor: routes each attempt through a pooled worker.
///
/// Workers only account for capacity. With none available the attempt still
/// runs, just without a worker's bookkeeping; monitoring reports the missing
/// workers instead.
struct PooledProcessor<P: JobData, R: JobData> {
    workers: Arc<WorkerPool<P, R>>,
    slot: Arc<ProcessorSlot<P, R>>,
}

#[async_trait]
impl<P: JobData, R: JobData> JobProcessor<P, R> for PooledProcessor<P, R> {
    async fn process(&self, job: Job<P, R>, ctx: JobContext) -> anyhow::Result<R> {
        match self.workers.acquire() {
            Some(permit) => permit.process(job, ctx).await,
            None => {
                debug!(job_id = %job.id, "no worker with spare capacity, running unassigned");
                let processor = current(&self.slot);
                processor.process(job, ctx).await
            }
        }
    }
}

fn millis(duration: Option<chrono::Duration>) -> i64 {
    duration.map(|d| d.num_milliseconds()).unwrap_or_default()
}

/// One log line per queue event, correlated by job id.
struct JobLogSink<P: JobData, R: JobData> {
    logger: Logger,
    // Weak: monitoring owns the queue, which owns this sink.
    monitoring: Weak<MonitoringService<P, R>>,
}

impl<P: JobData, R: JobData> EventSink<P, R> for JobLogSink<P, R> {
    fn emit(&self, event: &QueueEvent<P, R>) {
        let job = event.job();
        let log = self.logger.with_correlation(job.id);

        match event {
            QueueEvent::JobAdded { .. } => log_event!(
                Level::INFO,
                log,
                "job added",
                priority = job.priority,
                max_retries = job.max_retries
            ),
            QueueEvent::JobStarted { .. } => {
                log_event!(Level::INFO, log, "job started", attempt = job.attempt())
            }
            QueueEvent::JobCompleted { .. } => {
                let turnaround_ms = millis(job.turnaround());
                if let Some(monitoring) = self.monitoring.upgrade() {
                    monitoring.record_processing_time(turnaround_ms as f64);
                }
                log_event!(
                    Level::INFO,
                    log,
                    "job completed",
                    attempt = job.attempt(),
                    turnaround_ms,
                    execution_ms = millis(job.execution_time())
                );
            }
            QueueEvent::JobRetrying { error, delay, .. } => log_event!(
                Level::WARN,
                log,
                "job failed, retry scheduled",
                error = %error,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
            ),
            QueueEvent::JobFailed { error, .. } => log_event!(
                Level::ERROR,
                log,
                "job failed permanently",
                error = %error,
                retry_count = job.retry_count,
                execution_ms = millis(job.execution_time())
            ),
        }
    }
}

pub struct WorkflowEngine<P: JobData, R: JobData> {
    config: EngineConfig,
    queue: Queue<P, R>,
    workers: Arc<WorkerPool<P, R>>,
    monitoring: Arc<MonitoringService<P, R>>,
    logger: Logger,
    processor: Arc<ProcessorSlot<P, R>>,
    health_check: Mutex<Option<HealthCheckHandle>>,
}

impl WorkflowEngine<Value, Value> {
    /// Engine running the built-in `SimulatedWorkflow`.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let workflow = SimulatedWorkflow::new(
            Duration::from_millis(config.simulated_step_delay_ms),
            Logger::new(config.service_name.as_str()),
        );
        Self::with_processor(config, Arc::new(workflow))
    }
}

impl<P: JobData, R: JobData> WorkflowEngine<P, R> {
    pub fn with_processor(
        config: EngineConfig,
        processor: Arc<dyn JobProcessor<P, R>>,
    ) -> Result<Self, EngineError> {
        config.queue.validate()?;

        let logger = Logger::new(config.service_name.as_str());
        let queue = Queue::new(config.queue.clone());
        let workers = Arc::new(WorkerPool::new());
        let slot = Arc::new(RwLock::new(processor));

        workers.create_worker(
            WorkerOptions::new(DEFAULT_WORKER_ID, config.queue.max_concurrency),
            Arc::new(SlotProcessor {
                slot: Arc::clone(&slot),
            }),
        )?;
        queue.set_processor(Arc::new(PooledProcessor {
            workers: Arc::clone(&workers),
            slot: Arc::clone(&slot),
        }));

        let monitoring = Arc::new(MonitoringService::new(
            queue.clone(),
            Arc::clone(&workers),
            config.monitoring.clone(),
            logger.clone(),
        ));
        queue.subscribe(Arc::new(JobLogSink {
            logger: logger.clone(),
            monitoring: Arc::downgrade(&monitoring),
        }));

        Ok(Self {
            config,
            queue,
            workers,
            monitoring,
            logger,
            processor: slot,
            health_check: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workers(&self) -> &WorkerPool<P, R> {
        &self.workers
    }

    pub fn add_job(&self, payload: P, options: JobOptions) -> Job<P, R> {
        self.queue.add(payload, options)
    }

    /// Start the workers, then the queue.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        self.workers.start_all();
        self.queue.start();
        log_event!(Level::INFO, self.logger, "workflow engine started");
    }

    /// Stop the queue, the workers and the health monitor. In-flight jobs
    /// finish on their own.
    pub fn stop(&self) {
        self.queue.stop();
        self.workers.stop_all();
        self.stop_health_monitoring();
        log_event!(Level::INFO, self.logger, "workflow engine stopped");
    }

    /// `stop()` and cancel in-flight jobs.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        self.workers.stop_all();
        self.stop_health_monitoring();
        log_event!(Level::INFO, self.logger, "workflow engine shut down");
    }

    /// Replace the processor used for subsequent attempts.
    pub fn set_processor(&self, processor: Arc<dyn JobProcessor<P, R>>) {
        *self
            .processor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = processor;
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink<P, R>>) {
        self.queue.subscribe(sink);
    }

    pub fn get_job(&self, id: &JobId) -> Option<Job<P, R>> {
        self.queue.get_job(id)
    }

    pub fn get_all_jobs(&self) -> Vec<Job<P, R>> {
        self.queue.get_all_jobs()
    }

    pub fn get_jobs_by_state(&self, state: JobState) -> Vec<Job<P, R>> {
        self.queue.get_jobs_by_state(state)
    }

    pub fn clear_completed_jobs(&self) -> usize {
        self.queue.clear_completed()
    }

    pub fn clear_failed_jobs(&self) -> usize {
        self.queue.clear_failed()
    }

    pub fn get_metrics(&self) -> Metrics {
        self.monitoring.get_metrics()
    }

    pub fn get_queue_metrics(&self) -> QueueMetrics {
        self.queue.get_metrics()
    }

    pub fn get_health_status(&self) -> HealthStatus {
        self.monitoring.get_health_status()
    }

    /// (Re)start the periodic health check. A running one is replaced.
    pub fn start_health_monitoring(&self, interval: Duration) {
        let handle = self.monitoring.start_periodic_health_check(interval);
        let previous = self
            .health_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    pub fn stop_health_monitoring(&self) {
        let handle = self
            .health_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    pub fn is_health_monitoring(&self) -> bool {
        self.health_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(HealthCheckHandle::is_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    fn config(max_concurrency: usize) -> EngineConfig {
        EngineConfig {
            queue: QueueConfig {
                max_concurrency,
                retry_delay_base_ms: 10,
                ..QueueConfig::default()
            },
            simulated_step_delay_ms: 1,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn registers_default_worker_sized_to_the_queue() {
        let engine = WorkflowEngine::new(config(4)).unwrap();

        let workers = engine.workers().workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id, DEFAULT_WORKER_ID);
        assert_eq!(workers[0].concurrency, 4);
        assert!(!workers[0].active);
    }

    #[test]
    fn invalid_queue_config_is_rejected() {
        let result = WorkflowEngine::new(config(0));
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn start_and_stop_toggle_workers_and_health() {
        let engine = WorkflowEngine::new(config(2)).unwrap();
        assert!(!engine.get_health_status().is_healthy());

        engine.start();
        assert!(engine.get_health_status().is_healthy());
        assert_eq!(engine.get_health_status().active_workers, 1);

        engine.start_health_monitoring(Duration::from_secs(60));
        assert!(engine.is_health_monitoring());

        engine.stop();
        assert!(!engine.is_health_monitoring());
        assert_eq!(engine.get_health_status().active_workers, 0);
    }
}
