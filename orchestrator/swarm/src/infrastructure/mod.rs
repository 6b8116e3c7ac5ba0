// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! In-memory implementations of the task and discussion ports. Every write
//! happens under a single lock acquisition, so `claim` is atomic with respect
//! to any other caller sharing the repository.

use crate::domain::discussion::{Discussion, DiscussionId};
use crate::domain::repository::{DiscussionRepository, RepositoryError, TaskRepository};
use crate::domain::task::{SpecTask, TaskId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use switchyard_core::domain::agent::ProjectId;

#[derive(Default)]
struct TaskStore {
    tasks: HashMap<TaskId, SpecTask>,
    by_project: HashMap<ProjectId, Vec<TaskId>>,
}

#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    store: Arc<RwLock<TaskStore>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert_all(&self, tasks: &[SpecTask]) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        if let Some(existing) = tasks.iter().find(|t| store.tasks.contains_key(&t.id)) {
            return Err(RepositoryError::Conflict(format!("task {} already exists", existing.id)));
        }
        for task in tasks {
            store.by_project.entry(task.project_id).or_default().push(task.id);
            store.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn update(&self, task: &SpecTask) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        let stored = store
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("task {}", task.id)))?;
        *stored = task.clone();
        Ok(())
    }

    async fn find(&self, id: TaskId) -> Result<Option<SpecTask>, RepositoryError> {
        Ok(self.store.read().tasks.get(&id).cloned())
    }

    async fn list(&self, project: ProjectId) -> Result<Vec<SpecTask>, RepositoryError> {
        let store = self.store.read();
        Ok(store
            .by_project
            .get(&project)
            .into_iter()
            .flatten()
            .filter_map(|id| store.tasks.get(id).cloned())
            .collect())
    }

    async fn claim(&self, id: TaskId, agent: &str) -> Result<SpecTask, RepositoryError> {
        let mut store = self.store.write();
        let task = store
            .tasks
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("task {id}")))?;
        task.claim(agent)
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;
        Ok(task.clone())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDiscussionRepository {
    discussions: Arc<RwLock<HashMap<DiscussionId, Discussion>>>,
}

impl InMemoryDiscussionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiscussionRepository for InMemoryDiscussionRepository {
    async fn save(&self, discussion: &Discussion) -> Result<(), RepositoryError> {
        self.discussions.write().insert(discussion.id, discussion.clone());
        Ok(())
    }

    async fn find(&self, id: DiscussionId) -> Result<Option<Discussion>, RepositoryError> {
        Ok(self.discussions.read().get(&id).cloned())
    }

    async fn list_for_task(&self, task: TaskId) -> Result<Vec<Discussion>, RepositoryError> {
        let mut found: Vec<Discussion> = self
            .discussions
            .read()
            .values()
            .filter(|d| d.task_id == task)
            .cloned()
            .collect();
        found.sort_by_key(|d| d.created_at);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TaskStatus;

    #[tokio::test]
    async fn test_claim_is_won_once() {
        let repo = InMemoryTaskRepository::new();
        let task = SpecTask::new(ProjectId::new(), "t", "d", 0);
        repo.insert_all(std::slice::from_ref(&task)).await.unwrap();

        let claimed = repo.claim(task.id, "coder").await.unwrap();
        assert_eq!(claimed.status, TaskStatus::InProgress);
        let err = repo.claim(task.id, "other").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_insert_all_is_all_or_nothing() {
        let repo = InMemoryTaskRepository::new();
        let project = ProjectId::new();
        let first = SpecTask::new(project, "a", "", 0);
        repo.insert_all(std::slice::from_ref(&first)).await.unwrap();

        let second = SpecTask::new(project, "b", "", 0);
        let err = repo.insert_all(&[second.clone(), first.clone()]).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(repo.find(second.id).await.unwrap().is_none());
        assert_eq!(repo.list(project).await.unwrap().len(), 1);
    }
}
