//! Executes decomposed subtasks through the queue.
//!
//! `SubtaskRunner` is the `JobWorker` for subtask jobs: it records status in
//! the store, publishes progress on the `EventBus` and runs `ai_analysis`
//! subtasks against the completion service. `run_in_dependency_order`
//! enqueues each subtask once all of its dependencies have completed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::decompose::{Subtask, SubtaskStatus, SubtaskType, SubtaskUpdate};
use crate::error::{JobError, LlmError};
use crate::events::EventBus;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::queue::{ActiveJob, ExecutionQueue, JobSpec, JobWorker, QueueEvent, RetryPolicy, RetryStrategy};
use crate::store::SubtaskStore;

/// Queue payload for one subtask execution.
#[derive(Debug, Clone)]
pub struct SubtaskJob {
    pub agent_id: String,
    pub subtask: Subtask,
}

/// Retry label for a worker failure, based on the underlying LLM error.
pub fn classify_llm_error(error: &anyhow::Error) -> String {
    match error.downcast_ref::<LlmError>() {
        Some(LlmError::RateLimited { .. }) => "rate_limit".to_string(),
        Some(LlmError::RequestFailed { .. }) => "network".to_string(),
        Some(LlmError::InvalidResponse { .. }) | Some(LlmError::Json(_)) => "invalid_response".to_string(),
        Some(LlmError::AuthFailed { .. }) => "auth".to_string(),
        None => String::new(),
    }
}

/// Retry policy used for subtask jobs.
pub fn default_retry_strategy() -> RetryStrategy {
    RetryStrategy::new()
        .with_default(RetryPolicy::new(2).with_backoff(500, 2.0))
        .with("rate_limit", RetryPolicy::new(4).with_backoff(2_000, 2.0))
        .with("network", RetryPolicy::new(3).with_backoff(1_000, 2.0))
        .with("auth", RetryPolicy::new(1))
}

pub struct SubtaskRunner {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn SubtaskStore>,
    bus: Arc<EventBus>,
}

impl SubtaskRunner {
    pub fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn SubtaskStore>, bus: Arc<EventBus>) -> Self {
        Self { llm, store, bus }
    }

    async fn execute(&self, subtask: &Subtask) -> anyhow::Result<Value> {
        match subtask.subtask_type {
            SubtaskType::AiAnalysis => {
                let prompt = subtask
                    .config
                    .get("prompt")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}\n\n{}", subtask.title, subtask.description));

                let mut request = CompletionRequest::new(vec![ChatMessage::user(prompt)]);
                if let Some(model) = subtask.config.get("model").and_then(Value::as_str) {
                    request = request.with_model(model);
                }
                if let Some(temperature) = subtask.config.get("temperature").and_then(Value::as_f64) {
                    request = request.with_temperature(temperature as f32);
                }

                let response = self.llm.complete(request).await?;
                Ok(json!({
                    "content": response.content,
                    "inputTokens": response.input_tokens,
                    "outputTokens": response.output_tokens,
                }))
            }
            other => {
                debug!(subtask_id = %subtask.id, subtask_type = %other, "No executor for subtask type");
                Ok(json!({"skipped": true, "reason": format!("no executor for {other}")}))
            }
        }
    }
}

#[async_trait]
impl JobWorker<SubtaskJob> for SubtaskRunner {
    async fn run(&self, job: ActiveJob<SubtaskJob>) -> anyhow::Result<()> {
        let subtask = &job.payload.subtask;
        let agent_id = job.payload.agent_id.as_str();
        let execution_id = subtask.id.to_string();
        let attempt = job.snapshot.attempts + 1;

        self.store
            .update_subtask(
                subtask.id,
                &SubtaskUpdate {
                    status: Some(SubtaskStatus::Running),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.bus.emit_update(
            agent_id,
            &execution_id,
            json!({"type": "subtask_started", "subtaskId": subtask.id, "title": subtask.title, "attempt": attempt}),
        );

        let started = Instant::now();
        let result: anyhow::Result<Value> = tokio::select! {
            _ = job.cancelled() => Err(JobError::Cancelled { id: job.id() }.into()),
            result = self.execute(subtask) => result,
        };
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        match result {
            Ok(output) => {
                self.store
                    .update_subtask(
                        subtask.id,
                        &SubtaskUpdate {
                            status: Some(SubtaskStatus::Completed),
                            output_data: Some(output.clone()),
                            completed_at: Some(Utc::now()),
                            duration_ms: Some(duration_ms),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.bus.emit_update(
                    agent_id,
                    &execution_id,
                    json!({"type": "subtask_completed", "subtaskId": subtask.id, "output": output, "durationMs": duration_ms}),
                );
                Ok(())
            }
            Err(error) => {
                self.store
                    .update_subtask(
                        subtask.id,
                        &SubtaskUpdate {
                            status: Some(SubtaskStatus::Failed),
                            error_message: Some(error.to_string()),
                            duration_ms: Some(duration_ms),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.bus.emit_update(
                    agent_id,
                    &execution_id,
                    json!({"type": "subtask_failed", "subtaskId": subtask.id, "error": error.to_string(), "attempt": attempt}),
                );
                Err(error)
            }
        }
    }
}

/// Relay queue lifecycle events onto the bus.
pub fn bridge_queue_events<P>(queue: &ExecutionQueue<P>, bus: Arc<EventBus>) -> JoinHandle<()>
where
    P: Clone + Send + Sync + 'static,
{
    let mut rx = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let job = event.job();
                    let agent_id = job.agent_id.clone().unwrap_or_default();
                    let execution_id = job.execution_id.clone().unwrap_or_else(|| job.id.to_string());
                    match serde_json::to_value(&event) {
                        Ok(payload) => {
                            bus.emit_update(agent_id, execution_id, payload);
                        }
                        Err(e) => warn!(error = %e, "Failed to serialize queue event"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Queue event bridge lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Store a terminal failure unless the worker already recorded one. A worker
/// aborted by the queue timeout or a panic leaves the subtask `running`.
async fn record_failure(store: &dyn SubtaskStore, id: Uuid, reason: &str) -> anyhow::Result<()> {
    let current = store.get_subtask(id).await?;
    if current.is_some_and(|s| s.status == SubtaskStatus::Failed && s.error_message.is_some()) {
        return Ok(());
    }
    store
        .update_subtask(
            id,
            &SubtaskUpdate {
                status: Some(SubtaskStatus::Failed),
                error_message: Some(reason.to_string()),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

/// Outcome of [`run_in_dependency_order`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    /// Never started because a dependency did not complete.
    pub blocked: Vec<Uuid>,
}

/// Enqueue `subtasks` so that each starts only after its dependencies
/// completed. Dependents of failed or cancelled subtasks are marked failed
/// in the store without running.
pub async fn run_in_dependency_order(
    queue: &ExecutionQueue<SubtaskJob>,
    store: &dyn SubtaskStore,
    agent_id: &str,
    subtasks: &[Subtask],
    retry: &RetryStrategy,
) -> anyhow::Result<RunSummary> {
    let mut events = queue.subscribe();
    let by_id: HashMap<Uuid, &Subtask> = subtasks.iter().map(|s| (s.id, s)).collect();
    // Earlier in the list runs first when several are ready.
    let rank: HashMap<Uuid, f64> = subtasks
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id, (subtasks.len() - i) as f64))
        .collect();

    let mut waiting: Vec<Uuid> = subtasks.iter().map(|s| s.id).collect();
    let mut in_flight: HashSet<Uuid> = HashSet::new();
    let mut summary = RunSummary::default();
    let mut done: HashSet<Uuid> = HashSet::new();

    loop {
        let ready: Vec<Uuid> = waiting
            .iter()
            .copied()
            .filter(|id| by_id[id].dependencies.iter().all(|dep| done.contains(dep) || !by_id.contains_key(dep)))
            .collect();
        for id in ready {
            waiting.retain(|w| *w != id);
            in_flight.insert(id);
            let subtask = by_id[&id];
            queue
                .enqueue(
                    JobSpec::new(SubtaskJob {
                        agent_id: agent_id.to_string(),
                        subtask: subtask.clone(),
                    })
                    .with_execution_id(id.to_string())
                    .with_task_id(subtask.task_id.clone())
                    .with_agent_id(agent_id)
                    .with_priority(rank[&id])
                    .with_retry_strategy(retry.clone())
                    .with_classifier(classify_llm_error),
                )
                .await;
        }

        if in_flight.is_empty() {
            break;
        }

        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Dependency driver lagged behind queue events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(id) = event
            .job()
            .execution_id
            .as_deref()
            .and_then(|e| Uuid::parse_str(e).ok())
            .filter(|id| in_flight.contains(id))
        else {
            continue;
        };

        let reason = match &event {
            QueueEvent::JobCompleted { .. } => {
                in_flight.remove(&id);
                done.insert(id);
                summary.completed.push(id);
                continue;
            }
            QueueEvent::JobFailed { error, .. } => error.clone(),
            QueueEvent::JobCancelled { .. } | QueueEvent::JobSkipped { .. } => "cancelled".to_string(),
            _ => continue,
        };
        in_flight.remove(&id);
        summary.failed.push(id);
        record_failure(store, id, &reason).await?;
    }

    for id in waiting {
        info!(subtask_id = %id, "Subtask blocked by an incomplete dependency");
        store
            .update_subtask(
                id,
                &SubtaskUpdate {
                    status: Some(SubtaskStatus::Failed),
                    error_message: Some("dependency did not complete".to_string()),
                    ..Default::default()
                },
            )
            .await?;
        summary.blocked.push(id);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_llm_errors() {
        let rate: anyhow::Error = LlmError::RateLimited {
            provider: "p".into(),
            retry_after: None,
        }
        .into();
        assert_eq!(classify_llm_error(&rate), "rate_limit");

        let net: anyhow::Error = LlmError::RequestFailed {
            provider: "p".into(),
            reason: "reset".into(),
        }
        .into();
        assert_eq!(classify_llm_error(&net), "network");
        assert_eq!(classify_llm_error(&anyhow::anyhow!("other")), "");
    }

    #[test]
    fn retry_strategy_has_default_entry() {
        let strategy = default_retry_strategy();
        assert_eq!(strategy.resolve("unknown").unwrap().max_attempts, Some(2));
        assert_eq!(strategy.resolve("rate_limit").unwrap().max_attempts, Some(4));
    }
}
