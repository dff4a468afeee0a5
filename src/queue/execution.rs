//! Priority-ordered, concurrency-bounded execution queue.
//!
//! All mutations of the ordered queue, the running map and the active count
//! happen under one write lock that is never held across an await, so the
//! scheduler behaves as if driven by a single loop. Worker attempts run on
//! their own spawned tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Notify, RwLock, broadcast};
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::JobError;

use super::events::QueueEvent;
use super::job::{ActiveJob, Job, JobPhase, JobSnapshot, JobSpec, JobState, JobWorker};
use super::retry::{classify, is_cancellation};

/// Point-in-time projection of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Queued jobs in dequeue order.
    pub queue: Vec<JobSnapshot>,
    pub running: Vec<JobSnapshot>,
    /// Jobs waiting out a retry backoff (in neither `queue` nor `running`).
    pub retrying: Vec<JobSnapshot>,
    pub active_count: usize,
    pub concurrency: usize,
    /// `queue.len() + running.len()`.
    pub size: usize,
}

/// Jobs belonging to one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentJobs {
    pub queued: Vec<JobSnapshot>,
    pub running: Vec<JobSnapshot>,
}

/// Result of a successful `cancel_job`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cancellation {
    pub job: JobSnapshot,
    pub phase: JobPhase,
}

fn advance<P: Clone>(job: &mut Job<P>, target: JobState) {
    if let Err(reason) = job.transition_to(target) {
        warn!(job_id = %job.id, %reason, "Rejected job state transition");
    }
}

struct QueueState<P> {
    queue: VecDeque<Job<P>>,
    running: HashMap<Uuid, Job<P>>,
    retrying: HashMap<Uuid, Job<P>>,
    active_count: usize,
    next_seq: u64,
}

impl<P: Clone> QueueState<P> {
    fn insert(&mut self, mut job: Job<P>) {
        if job.cancelled {
            advance(&mut job, JobState::Cancelled);
            return;
        }
        let index = self.queue.iter().position(|existing| job.runs_before(existing));
        match index {
            Some(i) => self.queue.insert(i, job),
            None => self.queue.push_back(job),
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty() && self.retrying.is_empty()
    }

    fn sorted_running(&self) -> Vec<JobSnapshot> {
        let mut running: Vec<&Job<P>> = self.running.values().collect();
        running.sort_by_key(|job| job.seq);
        running.into_iter().map(Job::snapshot).collect()
    }
}

struct Inner<P> {
    concurrency: usize,
    job_timeout: Option<Duration>,
    worker: Arc<dyn JobWorker<P>>,
    state: RwLock<QueueState<P>>,
    events: broadcast::Sender<QueueEvent>,
    idle: Notify,
}

/// Execution queue for jobs carrying a payload of type `P`.
pub struct ExecutionQueue<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for ExecutionQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> ExecutionQueue<P>
where
    P: Clone + Send + Sync + 'static,
{
    /// Create a queue. Concurrency is clamped to at least 1.
    pub fn new(config: QueueConfig, worker: impl JobWorker<P> + 'static) -> Self {
        let (events, _rx) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                concurrency: config.concurrency.max(1),
                job_timeout: config.job_timeout,
                worker: Arc::new(worker),
                state: RwLock::new(QueueState {
                    queue: VecDeque::new(),
                    running: HashMap::new(),
                    retrying: HashMap::new(),
                    active_count: 0,
                    next_seq: 0,
                }),
                events,
                idle: Notify::new(),
            }),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Add a job. Processing starts on a separate task, never inline.
    pub async fn enqueue(&self, spec: JobSpec<P>) -> JobSnapshot {
        let snapshot = {
            let mut state = self.inner.state.write().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            let job = Job::from_spec(spec, seq);
            let snapshot = job.snapshot();
            state.insert(job);
            snapshot
        };

        debug!(job_id = %snapshot.id, priority = snapshot.priority, "Job queued");
        self.inner.emit(QueueEvent::JobQueued {
            job: snapshot.clone(),
        });
        self.inner.schedule();
        snapshot
    }

    /// Read-only projection of the queue.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.read().await;
        let mut retrying: Vec<&Job<P>> = state.retrying.values().collect();
        retrying.sort_by_key(|job| job.seq);
        QueueSnapshot {
            queue: state.queue.iter().map(Job::snapshot).collect(),
            running: state.sorted_running(),
            retrying: retrying.into_iter().map(Job::snapshot).collect(),
            active_count: state.active_count,
            concurrency: self.inner.concurrency,
            size: state.queue.len() + state.running.len(),
        }
    }

    pub async fn jobs_by_agent(&self, agent_id: &str) -> AgentJobs {
        if agent_id.is_empty() {
            return AgentJobs::default();
        }
        let snapshot = self.snapshot().await;
        let mine = |job: &JobSnapshot| job.agent_id.as_deref() == Some(agent_id);
        AgentJobs {
            queued: snapshot.queue.into_iter().filter(mine).collect(),
            running: snapshot.running.into_iter().filter(mine).collect(),
        }
    }

    /// Cancel the job carrying `execution_id`.
    ///
    /// Queued jobs are removed at once. Running jobs and jobs waiting to retry
    /// only get their cancellation flag and token set; the worker decides
    /// when to stop.
    pub async fn cancel_job(&self, execution_id: &str) -> Option<Cancellation> {
        if execution_id.is_empty() {
            return None;
        }

        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;

        if let Some(index) = state.queue.iter().position(|job| job.matches(execution_id)) {
            let mut job = state.queue.remove(index)?;
            job.cancelled = true;
            advance(&mut job, JobState::Cancelled);
            job.cancel.cancel();
            let snapshot = job.snapshot();
            info!(job_id = %job.id, execution_id, "Queued job cancelled");
            self.inner.emit(QueueEvent::JobCancelled {
                job: snapshot.clone(),
                phase: JobPhase::Queued,
            });
            self.inner.notify_if_idle(state);
            return Some(Cancellation {
                job: snapshot,
                phase: JobPhase::Queued,
            });
        }

        let (job, phase) = if let Some(job) = state.running.values_mut().find(|j| j.matches(execution_id)) {
            (job, JobPhase::Running)
        } else if let Some(job) = state.retrying.values_mut().find(|j| j.matches(execution_id)) {
            (job, JobPhase::RetryScheduled)
        } else {
            return None;
        };

        job.cancelled = true;
        job.cancel.cancel();
        let snapshot = job.snapshot();
        info!(job_id = %job.id, execution_id, phase = ?phase, "Cancellation requested");
        self.inner.emit(QueueEvent::JobCancellationRequested {
            job: snapshot.clone(),
        });
        Some(Cancellation {
            job: snapshot,
            phase,
        })
    }

    /// Change the priority of a queued job. Running jobs are not affected.
    pub async fn update_priority(&self, execution_id: &str, priority: f64) -> Option<JobSnapshot> {
        if execution_id.is_empty() || !priority.is_finite() {
            return None;
        }

        let snapshot = {
            let mut state = self.inner.state.write().await;
            let index = state.queue.iter().position(|job| job.matches(execution_id))?;
            let mut job = state.queue.remove(index)?;
            job.priority = priority;
            job.priority_updated_at = Some(Utc::now());
            let snapshot = job.snapshot();
            state.insert(job);
            snapshot
        };

        debug!(job_id = %snapshot.id, priority, "Job priority changed");
        self.inner.emit(QueueEvent::JobPriorityChanged {
            job: snapshot.clone(),
        });
        self.inner.schedule();
        Some(snapshot)
    }

    /// Wait until nothing is queued, running or waiting to retry.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.state.read().await.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl<P> Inner<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn emit(&self, event: QueueEvent) {
        // ok if no receivers are listening
        let _ = self.events.send(event);
    }

    fn notify_if_idle(&self, state: &QueueState<P>) {
        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Run the scheduling pass on a fresh task.
    fn schedule(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.process().await;
        });
    }

    async fn process(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;

            while state.active_count < self.concurrency {
                let Some(mut job) = state.queue.pop_front() else {
                    break;
                };
                if job.cancelled {
                    advance(&mut job, JobState::Cancelled);
                    self.emit(QueueEvent::JobSkipped {
                        job: job.snapshot(),
                    });
                    continue;
                }

                state.active_count += 1;
                advance(&mut job, JobState::Running);
                job.started_at = Some(Utc::now());
                job.next_retry_at = None;
                let active = job.activate();
                debug!(job_id = %job.id, attempt = job.attempts + 1, "Job started");
                self.emit(QueueEvent::JobStarted {
                    job: active.snapshot.clone(),
                });
                state.running.insert(job.id, job);
                started.push(active);
            }
            self.notify_if_idle(state);
        }

        for active in started {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.run(active).await;
            });
        }
    }

    async fn run(self: Arc<Self>, job: ActiveJob<P>) {
        let id = job.id();
        let attempt_token = job.cancellation_token();
        let worker = Arc::clone(&self.worker);
        let mut handle = tokio::spawn(async move { worker.run(job).await });

        let outcome = match self.job_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut handle).await {
                Ok(joined) => flatten(id, joined),
                Err(_) => {
                    attempt_token.cancel();
                    handle.abort();
                    warn!(job_id = %id, ?timeout, "Job timed out");
                    Err(JobError::TimedOut { id, timeout }.into())
                }
            },
            None => flatten(id, handle.await),
        };

        self.finish(id, outcome).await;
        self.schedule();
    }

    /// Apply the outcome of one attempt.
    async fn finish(self: &Arc<Self>, id: Uuid, outcome: anyhow::Result<()>) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let Some(mut job) = state.running.remove(&id) else {
            warn!(job_id = %id, "Finished job missing from running set");
            return;
        };
        state.active_count = state.active_count.saturating_sub(1);

        let error = match outcome {
            Ok(()) => {
                advance(&mut job, JobState::Completed);
                info!(job_id = %id, attempts = job.attempts + 1, "Job completed");
                self.emit(QueueEvent::JobCompleted {
                    job: job.snapshot(),
                });
                self.notify_if_idle(state);
                return;
            }
            Err(error) => error,
        };

        job.attempts += 1;
        let error_type = classify(job.classifier.as_deref(), &error);
        let count = {
            let entry = job.attempts_by_type.entry(error_type.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let policy = job
            .retry_strategy
            .as_ref()
            .and_then(|strategy| strategy.resolve(&error_type))
            .cloned();
        let max_attempts = policy
            .as_ref()
            .and_then(|p| p.max_attempts)
            .unwrap_or(job.max_attempts)
            .max(1);
        job.last_error_type = Some(error_type.clone());

        let should_retry = !job.cancelled && !is_cancellation(&error) && count < max_attempts;

        if should_retry {
            let delay = policy.map(|p| p.delay_for(count)).unwrap_or(Duration::ZERO);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            advance(&mut job, JobState::RetryScheduled);
            job.next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d));

            warn!(
                job_id = %id,
                error_type = %error_type,
                attempts = count,
                max_attempts,
                delay_ms,
                error = %error,
                "Job failed, retry scheduled"
            );
            self.emit(QueueEvent::JobRetry {
                job: job.snapshot(),
                error: error.to_string(),
                error_type,
                attempts: count,
                max_attempts,
                delay_ms,
            });
            state.retrying.insert(id, job);

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.requeue(id).await;
            });
        } else {
            advance(&mut job, JobState::Failed);
            warn!(
                job_id = %id,
                error_type = %error_type,
                attempts = count,
                max_attempts,
                error = %error,
                "Job failed"
            );
            self.emit(QueueEvent::JobFailed {
                job: job.snapshot(),
                error: error.to_string(),
                error_type,
                attempts: count,
                max_attempts,
            });
            self.notify_if_idle(state);
        }
    }

    /// Move a job out of its retry wait.
    async fn requeue(self: &Arc<Self>, id: Uuid) {
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(mut job) = state.retrying.remove(&id) else {
                return;
            };

            if job.cancelled {
                advance(&mut job, JobState::Cancelled);
                info!(job_id = %id, "Job cancelled during retry wait");
                self.emit(QueueEvent::JobCancelled {
                    job: job.snapshot(),
                    phase: JobPhase::RetryScheduled,
                });
                self.notify_if_idle(state);
                return;
            }

            advance(&mut job, JobState::Queued);
            state.insert(job);
        }
        self.schedule();
    }
}

fn flatten(id: Uuid, joined: Result<anyhow::Result<()>, JoinError>) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(JobError::Panicked {
            id,
            reason: e.to_string(),
        }
        .into()),
        Err(_) => Err(JobError::Cancelled { id }.into()),
    }
}
