//! `SubtaskStore` trait, the async persistence interface for decomposed subtasks.

use async_trait::async_trait;
use uuid::Uuid;

use crate::decompose::{Subtask, SubtaskUpdate};
use crate::error::DatabaseError;

/// Backend-agnostic subtask persistence.
#[async_trait]
pub trait SubtaskStore: Send + Sync {
    /// Insert a new subtask.
    async fn save(&self, subtask: &Subtask) -> Result<(), DatabaseError>;

    /// Get a subtask by ID.
    async fn get_subtask(&self, id: Uuid) -> Result<Option<Subtask>, DatabaseError>;

    /// All subtasks of a task, ordered by priority then creation time.
    async fn get_subtasks(&self, task_id: &str) -> Result<Vec<Subtask>, DatabaseError>;

    /// Apply a partial update. Returns `false` if the subtask does not exist.
    async fn update_subtask(&self, id: Uuid, update: &SubtaskUpdate) -> Result<bool, DatabaseError>;
}
