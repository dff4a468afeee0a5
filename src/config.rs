//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::decompose::DecompositionOptions;

/// Execution queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of jobs with in-flight work. Clamped to at least 1.
    pub concurrency: usize,
    /// Maximum wall time for a single worker invocation (`None` = unbounded).
    pub job_timeout: Option<Duration>,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            job_timeout: None,
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Create a config with the given concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Read queue settings from `AGENT_EXEC_*` environment variables.
    pub fn from_env() -> Self {
        let concurrency = std::env::var("AGENT_EXEC_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let job_timeout = std::env::var("AGENT_EXEC_JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            concurrency,
            job_timeout,
            ..Default::default()
        }
    }
}

/// Process-wide configuration assembled at startup.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub queue: QueueConfig,
    /// Runtime-supplied decomposition defaults (second in precedence after
    /// task-level options).
    pub decomposer: DecompositionOptions,
    /// Path of the libSQL subtask database.
    pub db_path: PathBuf,
    /// Directory for rolling log files (`None` = stderr only).
    pub log_dir: Option<PathBuf>,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let decomposer = DecompositionOptions {
            model: std::env::var("AGENT_EXEC_MODEL").ok(),
            max_subtasks: std::env::var("AGENT_EXEC_MAX_SUBTASKS")
                .ok()
                .and_then(|s| s.parse().ok()),
            context_limit: std::env::var("AGENT_EXEC_CONTEXT_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok()),
            ..Default::default()
        };

        let db_path = std::env::var("AGENT_EXEC_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/agent-exec.db"));

        Self {
            queue: QueueConfig::from_env(),
            decomposer,
            db_path,
            log_dir: std::env::var("AGENT_EXEC_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.concurrency, 1);
        assert!(config.job_timeout.is_none());
    }

    #[test]
    fn with_concurrency_keeps_other_defaults() {
        let config = QueueConfig::with_concurrency(4);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.event_capacity, 256);
    }
}
