use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agent_exec::config::CoreConfig;
use agent_exec::decompose::{AgentProfile, Task, TaskDecomposer};
use agent_exec::events::{ConnectionRegistry, EventBus, forward_to_registry};
use agent_exec::llm::{LlmConfig, create_provider};
use agent_exec::queue::ExecutionQueue;
use agent_exec::runner::{
    SubtaskRunner, bridge_queue_events, default_retry_strategy, run_in_dependency_order,
};
use agent_exec::store::{LibSqlSubtaskStore, SubtaskStore};

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-exec.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CoreConfig::from_env();
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let mut args = std::env::args().skip(1);
    let Some(title) = args.next() else {
        eprintln!("Usage: agent-exec <title> [description...]");
        std::process::exit(2);
    };
    let description = args.collect::<Vec<_>>().join(" ");

    let llm_config = LlmConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export OPENAI_API_KEY=sk-...  (or AGENT_EXEC_LLM_BACKEND=anthropic with ANTHROPIC_API_KEY)");
        std::process::exit(1);
    });
    let llm = create_provider(&llm_config)?;

    eprintln!("Agent Exec v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Concurrency: {}\n", config.queue.concurrency);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn SubtaskStore> = Arc::new(
        LibSqlSubtaskStore::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    // ── Progress events ──────────────────────────────────────────────────
    let agent = AgentProfile {
        id: std::env::var("AGENT_EXEC_AGENT_ID").unwrap_or_else(|_| "cli".to_string()),
        name: "CLI agent".to_string(),
        system_prompt: std::env::var("AGENT_EXEC_PERSONA").ok(),
        ..Default::default()
    };

    let bus = EventBus::new();
    let registry = ConnectionRegistry::new();
    let _forwarder = forward_to_registry(&bus, Arc::clone(&registry));

    if std::env::var("AGENT_EXEC_STREAM").is_ok_and(|v| v == "1") {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        registry.add_client(&agent.id, tx);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                eprint!("{frame}");
            }
        });
    }

    // ── Decompose ────────────────────────────────────────────────────────
    let task = Task::new(title, description);
    let decomposer = TaskDecomposer::new(Arc::clone(&llm), Arc::clone(&store));
    let subtasks = decomposer
        .decompose_task(&task, &agent, &config.decomposer)
        .await?;
    info!(task_id = %task.id, count = subtasks.len(), "Task decomposed");

    // ── Execute ──────────────────────────────────────────────────────────
    let queue = ExecutionQueue::new(
        config.queue.clone(),
        SubtaskRunner::new(llm, Arc::clone(&store), Arc::clone(&bus)),
    );
    let _bridge = bridge_queue_events(&queue, Arc::clone(&bus));
    let retry = default_retry_strategy();

    tokio::select! {
        result = run_in_dependency_order(&queue, store.as_ref(), &agent.id, &subtasks, &retry) => {
            let summary = result?;
            info!(
                completed = summary.completed.len(),
                failed = summary.failed.len(),
                blocked = summary.blocked.len(),
                "Execution finished"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling subtasks");
            for subtask in &subtasks {
                queue.cancel_job(&subtask.id.to_string()).await;
            }
        }
    }
    queue.wait_idle().await;

    for subtask in store.get_subtasks(&task.id).await? {
        match &subtask.error_message {
            Some(error) => eprintln!("  [{}] {}: {}", subtask.status, subtask.title, error),
            None => eprintln!("  [{}] {}", subtask.status, subtask.title),
        }
    }

    Ok(())
}
