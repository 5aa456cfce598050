//! Worker pool: named processing capacity.
//!
//! - Worker は processor を包み、in-flight 数と成功/失敗数を数える
//! - 並行数の上限そのものは Queue が守る。Worker 側は配分と報告のため
//! - 作成直後の Worker は停止状態（`start()` で有効になる）

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Job, JobData};
use crate::error::EngineError;
use crate::ports::{JobContext, JobProcessor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    pub id: String,
    /// Attempts this worker may run at once. Must be at least 1.
    pub concurrency: usize,
}

impl WorkerOptions {
    pub fn new(id: impl Into<String>, concurrency: usize) -> Self {
        Self {
            id: id.into(),
            concurrency,
        }
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: String,
    pub concurrency: usize,
    pub active: bool,
    pub in_flight: usize,
    pub processed: u64,
    pub failed: u64,
}

pub struct Worker<P: JobData, R: JobData> {
    id: String,
    concurrency: usize,
    active: AtomicBool,
    in_flight: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    processor: Arc<dyn JobProcessor<P, R>>,
}

impl<P: JobData, R: JobData> Worker<P, R> {
    fn new(options: WorkerOptions, processor: Arc<dyn JobProcessor<P, R>>) -> Self {
        Self {
            id: options.id,
            concurrency: options.concurrency,
            active: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            processor,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// Stop accepting work. Attempts already running are not interrupted.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Active and below its concurrency budget.
    pub fn can_process(&self) -> bool {
        self.is_active() && self.in_flight() < self.concurrency
    }

    /// Claim one slot if active and below budget.
    fn try_reserve(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= self.concurrency {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Run one attempt through this worker's processor.
    pub async fn process(&self, job: Job<P, R>, ctx: JobContext) -> anyhow::Result<R> {
        // drop されれば（abort 含む）必ず減算される
        let _in_flight = InFlightGuard::enter(&self.in_flight);
        self.run(job, ctx).await
    }

    async fn run(&self, job: Job<P, R>, ctx: JobContext) -> anyhow::Result<R> {
        let result = self.processor.process(job, ctx).await;
        match &result {
            Ok(_) => self.processed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id.clone(),
            concurrency: self.concurrency,
            active: self.is_active(),
            in_flight: self.in_flight(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A slot reserved on a worker by `WorkerPool::acquire`.
///
/// The slot is released when the permit is dropped, including when the
/// attempt running under it is aborted.
pub struct WorkerPermit<P: JobData, R: JobData> {
    worker: Arc<Worker<P, R>>,
}

impl<P: JobData, R: JobData> WorkerPermit<P, R> {
    pub fn worker(&self) -> &Worker<P, R> {
        &self.worker
    }

    /// Run one attempt in the reserved slot.
    pub async fn process(self, job: Job<P, R>, ctx: JobContext) -> anyhow::Result<R> {
        self.worker.run(job, ctx).await
    }
}

impl<P: JobData, R: JobData> Drop for WorkerPermit<P, R> {
    fn drop(&mut self) {
        self.worker.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of workers, kept in creation order.
pub struct WorkerPool<P: JobData, R: JobData> {
    workers: RwLock<Vec<Arc<Worker<P, R>>>>,
}

impl<P: JobData, R: JobData> Default for WorkerPool<P, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: JobData, R: JobData> WorkerPool<P, R> {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Worker<P, R>>>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new (stopped) worker.
    pub fn create_worker(
        &self,
        options: WorkerOptions,
        processor: Arc<dyn JobProcessor<P, R>>,
    ) -> Result<Arc<Worker<P, R>>, EngineError> {
        if options.concurrency == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "worker {} needs a concurrency of at least 1",
                options.id
            )));
        }

        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        if workers.iter().any(|w| w.id == options.id) {
            return Err(EngineError::DuplicateWorker(options.id));
        }

        let worker = Arc::new(Worker::new(options, processor));
        workers.push(Arc::clone(&worker));
        debug!(worker_id = %worker.id, concurrency = worker.concurrency, "worker created");
        Ok(worker)
    }

    /// Stop and deregister a worker.
    pub fn remove_worker(&self, id: &str) -> Option<Arc<Worker<P, R>>> {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        let index = workers.iter().position(|w| w.id == id)?;
        let worker = workers.remove(index);
        worker.stop();
        debug!(worker_id = %id, "worker removed");
        Some(worker)
    }

    pub fn get_worker(&self, id: &str) -> Option<Arc<Worker<P, R>>> {
        self.read().iter().find(|w| w.id == id).cloned()
    }

    pub fn get_active_worker_count(&self) -> usize {
        self.read().iter().filter(|w| w.is_active()).count()
    }

    pub fn workers(&self) -> Vec<WorkerStatus> {
        self.read().iter().map(|w| w.status()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn start_all(&self) {
        for worker in self.read().iter() {
            worker.start();
        }
    }

    pub fn stop_all(&self) {
        for worker in self.read().iter() {
            worker.stop();
        }
    }

    /// Reserve a slot on the first worker (in creation order) with spare
    /// capacity.
    pub fn acquire(&self) -> Option<WorkerPermit<P, R>> {
        self.read()
            .iter()
            .find(|w| w.try_reserve())
            .map(|w| WorkerPermit {
                worker: Arc::clone(w),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobId;
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;
    use ulid::Ulid;

    struct Echo;

    #[async_trait]
    impl JobProcessor<u32, u32> for Echo {
        async fn process(&self, job: Job<u32, u32>, _ctx: JobContext) -> anyhow::Result<u32> {
            if job.payload == 0 {
                bail!("zero");
            }
            Ok(job.payload)
        }
    }

    /// Blocks until the test releases it.
    struct Gate(tokio::sync::Mutex<Option<oneshot::Receiver<()>>>);

    #[async_trait]
    impl JobProcessor<u32, u32> for Gate {
        async fn process(&self, job: Job<u32, u32>, _ctx: JobContext) -> anyhow::Result<u32> {
            let rx = self.0.lock().await.take();
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            Ok(job.payload)
        }
    }

    fn job(payload: u32) -> (Job<u32, u32>, JobContext) {
        let id = JobId::from_ulid(Ulid::new());
        (
            Job::new(id, payload, 0, 0, Utc::now()),
            JobContext::new(id, CancellationToken::new()),
        )
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let pool: WorkerPool<u32, u32> = WorkerPool::new();
        pool.create_worker(WorkerOptions::new("a", 1), Arc::new(Echo))
            .unwrap();

        let err = pool
            .create_worker(WorkerOptions::new("a", 2), Arc::new(Echo))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DuplicateWorker(id) if id == "a"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let pool: WorkerPool<u32, u32> = WorkerPool::new();
        let result = pool.create_worker(WorkerOptions::new("a", 0), Arc::new(Echo));
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
        assert!(pool.is_empty());
    }

    #[test]
    fn only_started_workers_count_as_active() {
        let pool: WorkerPool<u32, u32> = WorkerPool::new();
        let a = pool
            .create_worker(WorkerOptions::new("a", 1), Arc::new(Echo))
            .unwrap();
        pool.create_worker(WorkerOptions::new("b", 1), Arc::new(Echo))
            .unwrap();
        assert_eq!(pool.get_active_worker_count(), 0);
        assert!(pool.acquire().is_none());

        a.start();
        assert_eq!(pool.get_active_worker_count(), 1);
        assert_eq!(pool.acquire().unwrap().worker().id(), "a");

        pool.start_all();
        assert_eq!(pool.get_active_worker_count(), 2);

        let removed = pool.remove_worker("a").unwrap();
        assert!(!removed.is_active());
        assert!(pool.get_worker("a").is_none());
        assert!(pool.remove_worker("a").is_none());

        pool.stop_all();
        assert_eq!(pool.get_active_worker_count(), 0);
    }

    #[test]
    fn acquire_reserves_capacity_until_the_permit_is_dropped() {
        let pool: WorkerPool<u32, u32> = WorkerPool::new();
        pool.create_worker(WorkerOptions::new("a", 2), Arc::new(Echo))
            .unwrap();
        pool.create_worker(WorkerOptions::new("b", 1), Arc::new(Echo))
            .unwrap();
        pool.start_all();

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        let third = pool.acquire().unwrap();
        assert_eq!(first.worker().id(), "a");
        assert_eq!(second.worker().id(), "a");
        assert_eq!(third.worker().id(), "b");
        assert_eq!(first.worker().in_flight(), 2);
        assert!(pool.acquire().is_none());

        drop(second);
        let again = pool.acquire().unwrap();
        assert_eq!(again.worker().id(), "a");
        assert!(pool.workers().iter().all(|w| w.in_flight <= w.concurrency));
    }

    #[tokio::test]
    async fn permit_runs_the_attempt_and_releases_its_slot() {
        let pool: WorkerPool<u32, u32> = WorkerPool::new();
        let worker = pool
            .create_worker(WorkerOptions::new("a", 1), Arc::new(Echo))
            .unwrap();
        worker.start();

        let permit = pool.acquire().unwrap();
        assert!(!worker.can_process());

        let (j, ctx) = job(5);
        assert_eq!(permit.process(j, ctx).await.unwrap(), 5);
        assert_eq!(worker.in_flight(), 0);
        assert_eq!(worker.status().processed, 1);
    }

    #[tokio::test]
    async fn process_counts_outcomes() {
        let pool: WorkerPool<u32, u32> = WorkerPool::new();
        let worker = pool
            .create_worker(WorkerOptions::new("a", 1), Arc::new(Echo))
            .unwrap();
        worker.start();

        let (ok, ctx) = job(7);
        assert_eq!(worker.process(ok, ctx).await.unwrap(), 7);
        let (bad, ctx) = job(0);
        assert!(worker.process(bad, ctx).await.is_err());

        let status = worker.status();
        assert_eq!(status.processed, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(status.in_flight, 0);
    }

    #[tokio::test]
    async fn busy_worker_is_skipped_and_released_on_completion() {
        let (release, rx) = oneshot::channel();
        let pool: WorkerPool<u32, u32> = WorkerPool::new();
        let busy = pool
            .create_worker(
                WorkerOptions::new("busy", 1),
                Arc::new(Gate(tokio::sync::Mutex::new(Some(rx)))),
            )
            .unwrap();
        pool.create_worker(WorkerOptions::new("spare", 1), Arc::new(Echo))
            .unwrap();
        pool.start_all();

        let (j, ctx) = job(1);
        let running = {
            let busy = Arc::clone(&busy);
            tokio::spawn(async move { busy.process(j, ctx).await })
        };
        while busy.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!busy.can_process());
        assert_eq!(pool.acquire().unwrap().worker().id(), "spare");

        release.send(()).unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(busy.in_flight(), 0);
        assert_eq!(pool.acquire().unwrap().worker().id(), "busy");
    }

    #[tokio::test]
    async fn aborted_attempt_releases_its_slot() {
        let (_release, rx) = oneshot::channel::<()>();
        let pool: WorkerPool<u32, u32> = WorkerPool::new();
        let worker = pool
            .create_worker(
                WorkerOptions::new("a", 1),
                Arc::new(Gate(tokio::sync::Mutex::new(Some(rx)))),
            )
            .unwrap();
        worker.start();

        let (j, ctx) = job(1);
        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.process(j, ctx).await })
        };
        while worker.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        running.abort();
        let _ = running.await;
        assert_eq!(worker.in_flight(), 0);
    }
}
