//! Domain model (ids, jobs, lifecycle events).

pub mod events;
pub mod ids;
pub mod job;

pub use self::events::QueueEvent;
pub use self::ids::JobId;
pub use self::job::{Job, JobData, JobFailure, JobOptions, JobState};
