//! Job scheduling.
//!
//! `ExecutionQueue` orders jobs by priority (ties by enqueue order), keeps at
//! most `concurrency` of them running, and retries failures according to a
//! per-error-type `RetryStrategy`. Every transition is broadcast as a
//! `QueueEvent`.

pub mod events;
pub mod execution;
pub mod job;
pub mod retry;

pub use events::QueueEvent;
pub use execution::{AgentJobs, Cancellation, ExecutionQueue, QueueSnapshot};
pub use job::{ActiveJob, FnWorker, JobPhase, JobSnapshot, JobSpec, JobState, JobWorker, worker_fn};
pub use retry::{DEFAULT_ERROR_TYPE, ErrorClassifier, RetryPolicy, RetryStrategy};
