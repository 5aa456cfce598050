//! Queue lifecycle events delivered to `EventSink` observers.

use std::time::Duration;

use super::job::{Job, JobFailure};

/// Events emitted by the queue, each carrying the job snapshot taken right
/// after the transition it describes.
///
/// Per job the order is always:
/// `JobAdded`, then (`JobStarted`, `JobRetrying`)*, then `JobStarted` followed
/// by exactly one of `JobCompleted` / `JobFailed`.
#[derive(Debug, Clone)]
pub enum QueueEvent<P, R> {
    JobAdded {
        job: Job<P, R>,
    },
    JobStarted {
        job: Job<P, R>,
    },
    JobCompleted {
        job: Job<P, R>,
    },
    /// Attempt failed and a retry was scheduled after `delay`.
    JobRetrying {
        job: Job<P, R>,
        error: JobFailure,
        delay: Duration,
    },
    /// Attempt failed and the job is now terminal.
    JobFailed {
        job: Job<P, R>,
        error: JobFailure,
    },
}

impl<P, R> QueueEvent<P, R> {
    pub fn job(&self) -> &Job<P, R> {
        match self {
            QueueEvent::JobAdded { job }
            | QueueEvent::JobStarted { job }
            | QueueEvent::JobCompleted { job }
            | QueueEvent::JobRetrying { job, .. }
            | QueueEvent::JobFailed { job, .. } => job,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::JobAdded { .. } => "job_added",
            QueueEvent::JobStarted { .. } => "job_started",
            QueueEvent::JobCompleted { .. } => "job_completed",
            QueueEvent::JobRetrying { .. } => "job_retrying",
            QueueEvent::JobFailed { .. } => "job_failed",
        }
    }
}
