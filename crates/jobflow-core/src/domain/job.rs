//! Job record and state management.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;

/// Bounds shared by job payloads and results.
///
/// The engine never inspects either; it only needs to clone them into
/// snapshots and move them across tasks.
pub trait JobData: Clone + Send + Sync + 'static {}

impl<T> JobData for T where T: Clone + Send + Sync + 'static {}

/// Job state.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Pending (retry, after backoff)
/// - Pending -> Processing -> Failed (retries exhausted or attempt cancelled)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for dispatch (possibly delayed by a retry backoff).
    Pending,

    /// Held in the in-flight set while the processor runs.
    Processing,

    /// Processor succeeded; `result` is set.
    Completed,

    /// Failed permanently; `error` is set.
    Failed,
}

impl JobState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque failure cause captured from a processor error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn from_error(error: &anyhow::Error) -> Self {
        Self::new(error.to_string())
    }

    /// Failure recorded when an in-flight attempt is cancelled.
    pub fn cancelled() -> Self {
        Self::new("job cancelled")
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Per-job overrides accepted by `Queue::add`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Higher values are dispatched first. Defaults to 0.
    pub priority: Option<i32>,

    /// Defaults to `QueueConfig::default_max_retries`.
    pub max_retries: Option<u32>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// One unit of submitted work.
///
/// The queue owns the authoritative copy; everything handed out (accessors,
/// events, processor input) is a snapshot clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job<P, R> {
    pub id: JobId,
    pub payload: P,
    pub state: JobState,
    pub priority: i32,

    /// Retries already scheduled. Never exceeds `max_retries`.
    pub retry_count: u32,
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Start of the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl<P, R> Job<P, R> {
    pub fn new(id: JobId, payload: P, priority: i32, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            state: JobState::Pending,
            priority,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            started_at: None,
            result: None,
            error: None,
        }
    }

    /// 1-indexed number of the current (or next) attempt.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall-clock time from creation to the terminal transition, retries included.
    pub fn turnaround(&self) -> Option<chrono::Duration> {
        self.is_terminal()
            .then(|| self.updated_at - self.created_at)
    }

    /// Time spent in the final attempt only.
    pub fn execution_time(&self) -> Option<chrono::Duration> {
        match (self.is_terminal(), self.started_at) {
            (true, Some(started_at)) => Some(self.updated_at - started_at),
            _ => None,
        }
    }

    pub(crate) fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.started_at = Some(now);
        self.touch(now);
    }

    pub(crate) fn complete(&mut self, result: R, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.result = Some(result);
        self.error = None;
        self.touch(now);
    }

    /// Back to Pending with one more retry consumed.
    pub(crate) fn requeue_for_retry(&mut self, now: DateTime<Utc>) {
        debug_assert!(self.retry_count < self.max_retries);
        self.retry_count += 1;
        self.state = JobState::Pending;
        self.touch(now);
    }

    /// Count an attempt against the budget without scheduling a retry.
    pub(crate) fn consume_attempt(&mut self) {
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
        }
    }

    pub(crate) fn fail(&mut self, error: JobFailure, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.error = Some(error);
        self.result = None;
        self.touch(now);
    }

    // updated_at never goes before created_at, even if the clock steps back.
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.created_at);
    }
}
