// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository ports for tasks and discussions.
//!
//! [`TaskRepository::claim`] is the only way a task enters `in_progress`;
//! implementations must make it a conditional write so two dispatchers
//! polling the same project can never both win the same task.

use crate::domain::discussion::{Discussion, DiscussionId};
use crate::domain::task::{SpecTask, TaskId};
use async_trait::async_trait;
use switchyard_core::domain::agent::ProjectId;
pub use switchyard_core::domain::repository::RepositoryError;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert tasks all-or-nothing.
    async fn insert_all(&self, tasks: &[SpecTask]) -> Result<(), RepositoryError>;

    async fn update(&self, task: &SpecTask) -> Result<(), RepositoryError>;

    async fn find(&self, id: TaskId) -> Result<Option<SpecTask>, RepositoryError>;

    /// Tasks of a project in creation order.
    async fn list(&self, project: ProjectId) -> Result<Vec<SpecTask>, RepositoryError>;

    /// Move a pending, unassigned task to `in_progress` under `agent`.
    /// Fails with `Conflict` when the task is no longer claimable.
    async fn claim(&self, id: TaskId, agent: &str) -> Result<SpecTask, RepositoryError>;
}

#[async_trait]
pub trait DiscussionRepository: Send + Sync {
    async fn save(&self, discussion: &Discussion) -> Result<(), RepositoryError>;

    async fn find(&self, id: DiscussionId) -> Result<Option<Discussion>, RepositoryError>;

    async fn list_for_task(&self, task: TaskId) -> Result<Vec<Discussion>, RepositoryError>;
}
