//! Queue state: job index, pending ordering, delayed retries, in-flight set.
//!
//! Design:
//! - `jobs` is the single source of truth; the heaps hold ids plus ordering keys.
//! - Every transition happens here, under the queue mutex, and pushes the
//!   matching event to `outbox` so delivery order equals mutation order.
//! - Time is passed in, which keeps this module runtime-free and testable.

use std::cmp::Ordering;
use std::collections::binary_heap::PeekMut;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::RetryPolicy;
use crate::domain::{Job, JobData, JobFailure, JobId, JobState, QueueEvent};
use crate::ports::JobProcessor;

// Used when a backoff delay would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Point-in-time job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Ready-queue entry: higher priority first, then earlier creation, then
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Retry waiting for its backoff to elapse.
///
/// Reverse ordering so the max-heap pops the earliest due entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledRetry {
    due: Instant,
    seq: u64,
    id: JobId,
}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct JobRecord<P, R> {
    job: Job<P, R>,
    /// Insertion order, the final FIFO tie-breaker.
    seq: u64,
    /// Set while the job is in flight.
    cancel: Option<CancellationToken>,
}

/// How an attempt ended.
pub(crate) enum AttemptOutcome<R> {
    Succeeded(R),
    Failed(JobFailure),
    Cancelled,
}

/// A job moved to Processing, ready to be handed to the processor.
pub(crate) struct Dispatch<P: JobData, R: JobData> {
    pub(crate) job: Job<P, R>,
    pub(crate) processor: Arc<dyn JobProcessor<P, R>>,
    pub(crate) token: CancellationToken,
}

pub(crate) struct QueueState<P: JobData, R: JobData> {
    jobs: HashMap<JobId, JobRecord<P, R>>,
    pending: BinaryHeap<PendingEntry>,
    scheduled: BinaryHeap<ScheduledRetry>,
    in_flight: HashSet<JobId>,
    next_seq: u64,

    pub(crate) running: bool,
    pub(crate) processor: Option<Arc<dyn JobProcessor<P, R>>>,
    /// Stops the current dispatch loop.
    pub(crate) dispatcher: Option<CancellationToken>,

    outbox: VecDeque<QueueEvent<P, R>>,
}

impl<P: JobData, R: JobData> QueueState<P, R> {
    pub(crate) fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            pending: BinaryHeap::new(),
            scheduled: BinaryHeap::new(),
            in_flight: HashSet::new(),
            next_seq: 0,
            running: false,
            processor: None,
            dispatcher: None,
            outbox: VecDeque::new(),
        }
    }

    /// Store a new pending job and return its snapshot.
    pub(crate) fn insert(&mut self, job: Job<P, R>) -> Job<P, R> {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.pending.push(PendingEntry {
            priority: job.priority,
            created_at: job.created_at,
            seq,
            id: job.id,
        });
        self.outbox.push_back(QueueEvent::JobAdded { job: job.clone() });
        let snapshot = job.clone();
        self.jobs.insert(
            job.id,
            JobRecord {
                job,
                seq,
                cancel: None,
            },
        );
        snapshot
    }

    /// Move retries whose backoff has elapsed back into the ready heap.
    pub(crate) fn promote_due(&mut self, now: Instant) {
        while let Some(top) = self.scheduled.peek_mut() {
            if top.due > now {
                break;
            }
            let entry = PeekMut::pop(top);
            if let Some(record) = self.jobs.get(&entry.id)
                && record.job.state == JobState::Pending
            {
                self.pending.push(PendingEntry {
                    priority: record.job.priority,
                    created_at: record.job.created_at,
                    seq: record.seq,
                    id: entry.id,
                });
            }
        }
    }

    /// Earliest instant at which a delayed retry becomes eligible.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.scheduled.peek().map(|entry| entry.due)
    }

    /// Fill free concurrency slots with the best eligible pending jobs.
    ///
    /// Inert while stopped or without a processor.
    pub(crate) fn take_dispatchable(
        &mut self,
        max_concurrency: usize,
        now: DateTime<Utc>,
    ) -> Vec<Dispatch<P, R>> {
        let mut started = Vec::new();
        if !self.running {
            return started;
        }
        let Some(processor) = self.processor.clone() else {
            return started;
        };

        while self.in_flight.len() < max_concurrency {
            let Some(entry) = self.pending.pop() else {
                break;
            };
            let Some(record) = self.jobs.get_mut(&entry.id) else {
                continue;
            };
            if record.job.state != JobState::Pending {
                continue;
            }

            record.job.start_attempt(now);
            let token = CancellationToken::new();
            record.cancel = Some(token.clone());
            self.in_flight.insert(entry.id);

            let job = record.job.clone();
            self.outbox
                .push_back(QueueEvent::JobStarted { job: job.clone() });
            started.push(Dispatch {
                job,
                processor: Arc::clone(&processor),
                token,
            });
        }
        started
    }

    /// Apply the outcome of an attempt and free its in-flight slot.
    ///
    /// Outcomes for jobs that are not Processing are ignored, which keeps
    /// terminal states final.
    pub(crate) fn finish(
        &mut self,
        id: &JobId,
        outcome: AttemptOutcome<R>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        instant: Instant,
    ) {
        self.in_flight.remove(id);
        let Some(record) = self.jobs.get_mut(id) else {
            return;
        };
        if record.job.state != JobState::Processing {
            return;
        }
        record.cancel = None;

        let event = match outcome {
            AttemptOutcome::Succeeded(result) => {
                record.job.complete(result, now);
                QueueEvent::JobCompleted {
                    job: record.job.clone(),
                }
            }
            AttemptOutcome::Failed(error) if record.job.retry_count < record.job.max_retries => {
                record.job.requeue_for_retry(now);
                let delay = policy.next_delay(record.job.retry_count);
                let due = instant
                    .checked_add(delay)
                    .unwrap_or_else(|| instant + FAR_FUTURE);
                self.scheduled.push(ScheduledRetry {
                    due,
                    seq: record.seq,
                    id: *id,
                });
                QueueEvent::JobRetrying {
                    job: record.job.clone(),
                    error,
                    delay,
                }
            }
            AttemptOutcome::Failed(error) => {
                record.job.fail(error.clone(), now);
                QueueEvent::JobFailed {
                    job: record.job.clone(),
                    error,
                }
            }
            AttemptOutcome::Cancelled => {
                let error = JobFailure::cancelled();
                record.job.consume_attempt();
                record.job.fail(error.clone(), now);
                QueueEvent::JobFailed {
                    job: record.job.clone(),
                    error,
                }
            }
        };
        self.outbox.push_back(event);
    }

    /// Cancel one in-flight attempt. Returns false if the job is not in flight.
    pub(crate) fn cancel(&self, id: &JobId) -> bool {
        match self.jobs.get(id).and_then(|record| record.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&self) -> usize {
        self.in_flight
            .iter()
            .filter(|id| self.cancel(id))
            .count()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn get(&self, id: &JobId) -> Option<Job<P, R>> {
        self.jobs.get(id).map(|record| record.job.clone())
    }

    /// Snapshots in creation order, optionally filtered by state.
    pub(crate) fn snapshot(&self, state: Option<JobState>) -> Vec<Job<P, R>> {
        let mut records: Vec<&JobRecord<P, R>> = self
            .jobs
            .values()
            .filter(|record| state.is_none_or(|s| record.job.state == s))
            .collect();
        records.sort_by_key(|record| record.seq);
        records.into_iter().map(|record| record.job.clone()).collect()
    }

    /// Remove every job in the given terminal state.
    pub(crate) fn clear(&mut self, state: JobState) -> usize {
        debug_assert!(state.is_terminal());
        let before = self.jobs.len();
        self.jobs.retain(|_, record| record.job.state != state);
        before - self.jobs.len()
    }

    pub(crate) fn metrics(&self) -> QueueMetrics {
        let mut metrics = QueueMetrics::default();
        for record in self.jobs.values() {
            match record.job.state {
                JobState::Pending => metrics.pending += 1,
                JobState::Processing => metrics.processing += 1,
                JobState::Completed => metrics.completed += 1,
                JobState::Failed => metrics.failed += 1,
            }
        }
        metrics.total = self.jobs.len();
        metrics
    }

    pub(crate) fn next_event(&mut self) -> Option<QueueEvent<P, R>> {
        self.outbox.pop_front()
    }

    pub(crate) fn has_events(&self) -> bool {
        !self.outbox.is_empty()
    }
}
