//! Error types for the agent execution core.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by, or handed to, queued jobs.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Worker gave up because the job was cancelled. Never retried.
    #[error("Job {id} cancelled")]
    Cancelled { id: Uuid },

    /// Worker exceeded the configured execution timeout.
    #[error("Job {id} timed out after {timeout:?}")]
    TimedOut { id: Uuid, timeout: Duration },

    /// Worker task panicked.
    #[error("Job {id} worker panicked: {reason}")]
    Panicked { id: Uuid, reason: String },
}

impl JobError {
    /// Whether this error marks a cancellation (suppresses retry).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Decomposition errors that cannot be absorbed by the fallback graph.
#[derive(Debug, thiserror::Error)]
pub enum DecomposeError {
    #[error("Failed to persist subtask {subtask_id}: {source}")]
    Persistence {
        subtask_id: Uuid,
        #[source]
        source: DatabaseError,
    },
}
