//! Job types: `JobSpec`, the internal record, snapshots and the worker contract.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::retry::{ErrorClassifier, RetryStrategy};

/// State of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    RetryScheduled,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, RetryScheduled) |
            (RetryScheduled, Queued) | (RetryScheduled, Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::RetryScheduled => "retry_scheduled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Where a job was when cancellation hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Running,
    RetryScheduled,
}

/// What a caller hands to `ExecutionQueue::enqueue`.
pub struct JobSpec<P> {
    pub payload: P,
    pub execution_id: Option<String>,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub priority: Option<f64>,
    pub max_attempts: Option<u32>,
    pub retry_strategy: Option<RetryStrategy>,
    pub classifier: Option<Arc<dyn ErrorClassifier>>,
}

impl<P> JobSpec<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            execution_id: None,
            task_id: None,
            agent_id: None,
            user_id: None,
            priority: None,
            max_attempts: None,
            retry_strategy: None,
            classifier: None,
        }
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    pub fn with_task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn with_agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_classifier(mut self, classifier: impl ErrorClassifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }
}

/// Read-only value copy of a job's bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: Uuid,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub execution_id: Option<String>,
    pub task_id: Option<String>,
    pub priority: f64,
    pub attempts: u32,
    pub attempts_by_type: BTreeMap<String, u32>,
    pub max_attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub priority_updated_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub retry_strategy: Option<RetryStrategy>,
    pub last_error_type: Option<String>,
    pub cancel_requested: bool,
}

/// Scheduler-owned job record.
pub(crate) struct Job<P> {
    pub id: Uuid,
    /// Enqueue order; tie-breaker for equal priorities, kept across requeues.
    pub seq: u64,
    pub payload: P,
    pub execution_id: Option<String>,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub priority: f64,
    pub attempts: u32,
    pub attempts_by_type: BTreeMap<String, u32>,
    pub max_attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub priority_updated_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub retry_strategy: Option<RetryStrategy>,
    pub classifier: Option<Arc<dyn ErrorClassifier>>,
    pub last_error_type: Option<String>,
    pub cancelled: bool,
    pub cancel: CancellationToken,
}

impl<P: Clone> Job<P> {
    pub fn from_spec(spec: JobSpec<P>, seq: u64) -> Self {
        let priority = spec.priority.filter(|p| p.is_finite()).unwrap_or(0.0);
        Self {
            id: Uuid::new_v4(),
            seq,
            payload: spec.payload,
            execution_id: spec.execution_id,
            task_id: spec.task_id,
            agent_id: spec.agent_id,
            user_id: spec.user_id,
            priority,
            attempts: 0,
            attempts_by_type: BTreeMap::new(),
            max_attempts: spec.max_attempts.unwrap_or(1).max(1),
            queued_at: Utc::now(),
            started_at: None,
            next_retry_at: None,
            priority_updated_at: None,
            state: JobState::Queued,
            retry_strategy: spec.retry_strategy,
            classifier: spec.classifier,
            last_error_type: None,
            cancelled: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Move to `target`, rejecting transitions the state machine forbids.
    pub fn transition_to(&mut self, target: JobState) -> Result<(), String> {
        if !self.state.can_transition_to(target) {
            return Err(format!("Cannot transition from {} to {}", self.state, target));
        }
        self.state = target;
        Ok(())
    }

    pub fn matches(&self, execution_id: &str) -> bool {
        self.execution_id.as_deref() == Some(execution_id)
    }

    /// Whether `self` should be dequeued before `other`.
    pub fn runs_before(&self, other: &Self) -> bool {
        if self.priority == other.priority {
            self.seq < other.seq
        } else {
            self.priority > other.priority
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            agent_id: self.agent_id.clone(),
            user_id: self.user_id.clone(),
            execution_id: self.execution_id.clone(),
            task_id: self.task_id.clone(),
            priority: self.priority,
            attempts: self.attempts,
            attempts_by_type: self.attempts_by_type.clone(),
            max_attempts: self.max_attempts,
            queued_at: self.queued_at,
            started_at: self.started_at,
            next_retry_at: self.next_retry_at,
            priority_updated_at: self.priority_updated_at,
            state: self.state,
            retry_strategy: self.retry_strategy.clone(),
            last_error_type: self.last_error_type.clone(),
            cancel_requested: self.cancelled,
        }
    }

    /// Build the view handed to the worker for one attempt.
    ///
    /// The attempt token is a child of the job token: cancelling the job
    /// reaches every attempt, a timeout only ends the current one.
    pub fn activate(&self) -> ActiveJob<P> {
        ActiveJob {
            snapshot: self.snapshot(),
            payload: self.payload.clone(),
            cancel: self.cancel.child_token(),
        }
    }
}

/// A job as seen by the worker during one attempt.
pub struct ActiveJob<P> {
    pub snapshot: JobSnapshot,
    pub payload: P,
    cancel: CancellationToken,
}

impl<P> ActiveJob<P> {
    pub fn id(&self) -> Uuid {
        self.snapshot.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested; use inside `tokio::select!`.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Runs one job attempt. Returning `Err` signals failure.
#[async_trait]
pub trait JobWorker<P>: Send + Sync
where
    P: Send + 'static,
{
    async fn run(&self, job: ActiveJob<P>) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a `JobWorker`.
pub struct FnWorker<F>(F);

pub fn worker_fn<F>(f: F) -> FnWorker<F> {
    FnWorker(f)
}

#[async_trait]
impl<P, F, Fut> JobWorker<P> for FnWorker<F>
where
    P: Send + 'static,
    F: Fn(ActiveJob<P>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, job: ActiveJob<P>) -> anyhow::Result<()> {
        (self.0)(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(priority: f64, seq: u64) -> Job<()> {
        Job::from_spec(JobSpec::new(()).with_priority(priority), seq)
    }

    #[test]
    fn spec_defaults() {
        let job = Job::from_spec(JobSpec::new(()), 0);
        assert_eq!(job.priority, 0.0);
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.state, JobState::Queued);
        assert!(!job.cancelled);
    }

    #[test]
    fn non_finite_priority_defaults_to_zero() {
        assert_eq!(job(f64::NAN, 0).priority, 0.0);
        assert_eq!(job(f64::INFINITY, 0).priority, 0.0);
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let job = Job::from_spec(JobSpec::new(()).with_max_attempts(0), 0);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn ordering_priority_then_seq() {
        assert!(job(5.0, 2).runs_before(&job(1.0, 1)));
        assert!(job(5.0, 0).runs_before(&job(5.0, 2)));
        assert!(!job(5.0, 2).runs_before(&job(5.0, 0)));
    }

    #[test]
    fn job_cancel_reaches_attempt_token() {
        let job = job(0.0, 0);
        let active = job.activate();
        assert!(!active.is_cancelled());
        job.cancel.cancel();
        assert!(active.is_cancelled());
    }

    #[test]
    fn state_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::RetryScheduled));
        assert!(JobState::RetryScheduled.can_transition_to(JobState::Queued));
        assert!(!JobState::Completed.can_transition_to(JobState::Queued));
        assert!(!JobState::Failed.can_transition_to(JobState::Running));
    }

    #[test]
    fn transition_to_rejects_illegal_moves() {
        let mut job = job(0.0, 0);
        assert!(job.transition_to(JobState::Completed).is_err());
        assert_eq!(job.state, JobState::Queued);

        job.transition_to(JobState::Running).unwrap();
        job.transition_to(JobState::Completed).unwrap();
        assert!(job.transition_to(JobState::Running).is_err());
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn state_display_and_serde_agree() {
        let json = serde_json::to_string(&JobState::RetryScheduled).unwrap();
        assert_eq!(json, "\"retry_scheduled\"");
        assert_eq!(JobState::RetryScheduled.to_string(), "retry_scheduled");
    }

    #[test]
    fn snapshot_is_camel_case() {
        let json = serde_json::to_value(job(1.0, 0).snapshot()).unwrap();
        assert!(json.get("attemptsByType").is_some());
        assert_eq!(json["cancelRequested"], false);
    }
}
