//! Queue module: priority dispatch, retry backoff, and event delivery.
//!
//! `Queue` is a cheap handle around shared state. `start()` spawns one
//! dispatch loop; each attempt runs on its own task and reports back through
//! `QueueState::finish`.

mod retry;
mod state;

pub use retry::{Backoff, RetryPolicy};
pub use state::QueueMetrics;

use std::future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::state::{AttemptOutcome, Dispatch, QueueState};
use crate::config::QueueConfig;
use crate::domain::{Job, JobData, JobFailure, JobId, JobOptions, JobState};
use crate::ports::{
    Clock, EventSink, IdGenerator, JobContext, JobProcessor, SystemClock, UlidGenerator,
};

struct Shared<P: JobData, R: JobData> {
    config: QueueConfig,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,

    state: Mutex<QueueState<P, R>>,
    /// Wakes the dispatch loop (new job, freed slot, new processor).
    notify: Notify,

    sinks: RwLock<Vec<Arc<dyn EventSink<P, R>>>>,
    /// Held by whichever thread is currently draining the outbox.
    delivery: Mutex<()>,
}

impl<P: JobData, R: JobData> Shared<P, R> {
    fn lock(&self) -> MutexGuard<'_, QueueState<P, R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain queued events to the sinks, outside the state lock.
    ///
    /// Only one thread delivers at a time; the others leave their events in
    /// the outbox for it, so sinks observe mutation order.
    fn deliver_events(&self) {
        loop {
            let guard = match self.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };

            loop {
                let Some(event) = self.lock().next_event() else {
                    break;
                };
                let sinks = self
                    .sinks
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for sink in &sinks {
                    sink.emit(&event);
                }
            }
            drop(guard);

            // An event pushed while we were releasing the guard would
            // otherwise sit in the outbox.
            if !self.lock().has_events() {
                return;
            }
        }
    }
}

/// In-memory priority job queue.
///
/// Cloning yields another handle to the same queue.
pub struct Queue<P: JobData, R: JobData> {
    shared: Arc<Shared<P, R>>,
}

impl<P: JobData, R: JobData> Clone for Queue<P, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: JobData, R: JobData> Queue<P, R> {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_ports(
            config,
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        )
    }

    /// Queue with injected time and id sources.
    pub fn with_ports(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let retry_policy = config.retry_policy();
        Self {
            shared: Arc::new(Shared {
                config,
                retry_policy,
                clock,
                ids,
                state: Mutex::new(QueueState::new()),
                notify: Notify::new(),
                sinks: RwLock::new(Vec::new()),
                delivery: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Register the processor. Until one is set, jobs stay pending.
    pub fn set_processor(&self, processor: Arc<dyn JobProcessor<P, R>>) {
        self.shared.lock().processor = Some(processor);
        self.shared.notify.notify_one();
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink<P, R>>) {
        self.shared
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Store a new pending job and return its snapshot.
    pub fn add(&self, payload: P, options: JobOptions) -> Job<P, R> {
        let now = self.shared.clock.now();
        let id = self.shared.ids.generate_job_id();
        let job = Job::new(
            id,
            payload,
            options.priority.unwrap_or(0),
            options
                .max_retries
                .unwrap_or(self.shared.config.default_max_retries),
            now,
        );
        let priority = job.priority;

        let snapshot = self.shared.lock().insert(job);
        self.shared.deliver_events();
        self.shared.notify.notify_one();

        debug!(job_id = %id, priority, "job added");
        snapshot
    }

    /// Start the dispatch loop. No-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let token = CancellationToken::new();
        {
            let mut state = self.shared.lock();
            if state.running {
                return;
            }
            state.running = true;
            state.dispatcher = Some(token.clone());
        }

        tokio::spawn(dispatch_loop(Arc::clone(&self.shared), token));
        debug!(
            max_concurrency = self.shared.config.max_concurrency,
            "queue started"
        );
    }

    /// Stop dispatching. In-flight attempts run to completion and delayed
    /// retries wait for the next `start()`.
    pub fn stop(&self) {
        let dispatcher = {
            let mut state = self.shared.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.dispatcher.take()
        };

        if let Some(token) = dispatcher {
            token.cancel();
        }
        debug!("queue stopped");
    }

    /// `stop()` and cancel every in-flight attempt.
    pub fn shutdown(&self) {
        self.stop();
        let cancelled = self.shared.lock().cancel_all();
        debug!(cancelled, "queue shut down");
    }

    /// Cancel an in-flight attempt. Returns false if the job is not processing.
    pub fn cancel(&self, id: &JobId) -> bool {
        self.shared.lock().cancel(id)
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.lock().in_flight_count()
    }

    pub fn get_job(&self, id: &JobId) -> Option<Job<P, R>> {
        self.shared.lock().get(id)
    }

    pub fn get_all_jobs(&self) -> Vec<Job<P, R>> {
        self.shared.lock().snapshot(None)
    }

    pub fn get_jobs_by_state(&self, state: JobState) -> Vec<Job<P, R>> {
        self.shared.lock().snapshot(Some(state))
    }

    /// Remove completed jobs. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        self.shared.lock().clear(JobState::Completed)
    }

    /// Remove failed jobs. Returns how many were removed.
    pub fn clear_failed(&self) -> usize {
        self.shared.lock().clear(JobState::Failed)
    }

    pub fn get_metrics(&self) -> QueueMetrics {
        self.shared.lock().metrics()
    }
}

async fn dispatch_loop<P: JobData, R: JobData>(
    shared: Arc<Shared<P, R>>,
    stop: CancellationToken,
) {
    loop {
        let (batch, next_due) = {
            let mut state = shared.lock();
            state.promote_due(Instant::now());
            let batch =
                state.take_dispatchable(shared.config.max_concurrency, shared.clock.now());
            (batch, state.next_due())
        };
        shared.deliver_events();

        for dispatch in batch {
            debug!(job_id = %dispatch.job.id, attempt = dispatch.job.attempt(), "dispatching job");
            tokio::spawn(run_attempt(Arc::clone(&shared), dispatch));
        }

        // Wait for notification OR next scheduled retry
        let next_retry = async {
            match next_due {
                Some(due) => tokio::time::sleep_until(due).await,
                None => future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = shared.notify.notified() => {}
            _ = next_retry => {}
        }
    }

    // A permit consumed by this loop may belong to its successor.
    shared.notify.notify_one();
}

async fn run_attempt<P: JobData, R: JobData>(shared: Arc<Shared<P, R>>, dispatch: Dispatch<P, R>) {
    let Dispatch {
        job,
        processor,
        token,
    } = dispatch;
    let id = job.id;
    let ctx = JobContext::new(id, token.clone());

    // A separate task so a panicking processor surfaces as a JoinError.
    let mut attempt = tokio::spawn(async move { processor.process(job, ctx).await });

    let outcome = tokio::select! {
        joined = &mut attempt => match joined {
            Ok(Ok(result)) => AttemptOutcome::Succeeded(result),
            Ok(Err(error)) => AttemptOutcome::Failed(JobFailure::from_error(&error)),
            Err(e) if e.is_panic() => AttemptOutcome::Failed(JobFailure::new("processor panicked")),
            Err(_) => AttemptOutcome::Cancelled,
        },
        _ = token.cancelled() => {
            attempt.abort();
            AttemptOutcome::Cancelled
        }
    };

    shared.lock().finish(
        &id,
        outcome,
        &shared.retry_policy,
        shared.clock.now(),
        Instant::now(),
    );
    shared.deliver_events();
    shared.notify.notify_one();
}
