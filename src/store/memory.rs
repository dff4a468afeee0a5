//! In-memory `SubtaskStore` for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::decompose::{Subtask, SubtaskUpdate};
use crate::error::DatabaseError;
use crate::store::traits::SubtaskStore;

#[derive(Default)]
pub struct MemorySubtaskStore {
    subtasks: RwLock<HashMap<Uuid, Subtask>>,
}

impl MemorySubtaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.subtasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subtasks.read().await.is_empty()
    }
}

#[async_trait]
impl SubtaskStore for MemorySubtaskStore {
    async fn save(&self, subtask: &Subtask) -> Result<(), DatabaseError> {
        let mut subtasks = self.subtasks.write().await;
        if subtasks.contains_key(&subtask.id) {
            return Err(DatabaseError::Query(format!(
                "save_subtask: duplicate id {}",
                subtask.id
            )));
        }
        subtasks.insert(subtask.id, subtask.clone());
        Ok(())
    }

    async fn get_subtask(&self, id: Uuid) -> Result<Option<Subtask>, DatabaseError> {
        Ok(self.subtasks.read().await.get(&id).cloned())
    }

    async fn get_subtasks(&self, task_id: &str) -> Result<Vec<Subtask>, DatabaseError> {
        let mut matching: Vec<Subtask> = self
            .subtasks
            .read()
            .await
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.priority
                .total_cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(matching)
    }

    async fn update_subtask(&self, id: Uuid, update: &SubtaskUpdate) -> Result<bool, DatabaseError> {
        match self.subtasks.write().await.get_mut(&id) {
            Some(subtask) => {
                subtask.apply(update);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::{SubtaskStatus, SubtaskType};

    #[tokio::test]
    async fn save_get_update() {
        let store = MemorySubtaskStore::new();
        let subtask = Subtask::new("task", "Plan", SubtaskType::AiAnalysis);
        store.save(&subtask).await.unwrap();
        assert!(store.save(&subtask).await.is_err());

        assert!(store
            .update_subtask(subtask.id, &SubtaskUpdate::status(SubtaskStatus::Running))
            .await
            .unwrap());
        let fetched = store.get_subtask(subtask.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SubtaskStatus::Running);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn ordered_by_priority() {
        let store = MemorySubtaskStore::new();
        for (title, priority) in [("b", 2.0), ("a", 1.0), ("c", 3.0)] {
            let mut subtask = Subtask::new("task", title, SubtaskType::AiAnalysis);
            subtask.priority = priority;
            store.save(&subtask).await.unwrap();
        }
        let titles: Vec<String> = store
            .get_subtasks("task")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.title)
            .collect();
        assert_eq!(titles, vec!["a", "b", "c"]);
    }
}
