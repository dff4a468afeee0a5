//! Queue lifecycle events.

use serde::Serialize;

use super::job::{JobPhase, JobSnapshot};

/// Lifecycle events broadcast by the execution queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    JobQueued {
        job: JobSnapshot,
    },
    JobStarted {
        job: JobSnapshot,
    },
    JobCompleted {
        job: JobSnapshot,
    },
    /// A failed attempt will be retried after `delay_ms`.
    JobRetry {
        job: JobSnapshot,
        error: String,
        error_type: String,
        attempts: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    /// Terminal failure.
    JobFailed {
        job: JobSnapshot,
        error: String,
        error_type: String,
        attempts: u32,
        max_attempts: u32,
    },
    JobCancelled {
        job: JobSnapshot,
        phase: JobPhase,
    },
    /// Cancellation was requested for a job that is running or waiting to retry.
    JobCancellationRequested {
        job: JobSnapshot,
    },
    /// A cancelled job reached the head of the queue and was dropped.
    JobSkipped {
        job: JobSnapshot,
    },
    JobPriorityChanged {
        job: JobSnapshot,
    },
}

impl QueueEvent {
    pub fn job(&self) -> &JobSnapshot {
        match self {
            Self::JobQueued { job }
            | Self::JobStarted { job }
            | Self::JobCompleted { job }
            | Self::JobRetry { job, .. }
            | Self::JobFailed { job, .. }
            | Self::JobCancelled { job, .. }
            | Self::JobCancellationRequested { job }
            | Self::JobSkipped { job }
            | Self::JobPriorityChanged { job } => job,
        }
    }

    /// Short event name, e.g. for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobQueued { .. } => "job_queued",
            Self::JobStarted { .. } => "job_started",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobRetry { .. } => "job_retry",
            Self::JobFailed { .. } => "job_failed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::JobCancellationRequested { .. } => "job_cancellation_requested",
            Self::JobSkipped { .. } => "job_skipped",
            Self::JobPriorityChanged { .. } => "job_priority_changed",
        }
    }
}
