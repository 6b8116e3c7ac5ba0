// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Spec Tasks
//!
//! A [`SpecTask`] is one unit of planned work inside a project's task graph.
//! The dispatcher owns every transition:
//!
//! ```text
//! pending ──claim──▶ in_progress ──complete──▶ completed
//!    ▲                   │
//!    └──── requeue ──────┤ (retry_count < max_retries)
//!                        └──────────────────▶ failed
//! pending ──skip──▶ skipped   (a predecessor failed for good)
//! ```
//!
//! Cancellation releases an in-progress task back to `pending` without
//! consuming a retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use switchyard_core::domain::agent::ProjectId;
use switchyard_core::domain::run::{AgentRun, RunId};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped)
    }

    /// Terminal without success; dependents can never run.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Dispatches so far, including the current one.
    pub attempts: u32,
    /// Steps spent across every attempt.
    pub total_steps: u32,
    pub last_run_id: Option<RunId>,
    pub duration_ms: u64,
}

impl TaskMetrics {
    fn record_attempt(&mut self, run: Option<&AgentRun>, duration_ms: u64) {
        if let Some(run) = run {
            self.total_steps += run.steps_this_attempt();
            self.last_run_id = Some(run.id);
        }
        self.duration_ms += duration_ms;
    }
}

/// What a failure did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued { retry_count: u32 },
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecTask {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Agent name preferred by whoever planned the task.
    pub agent_hint: Option<String>,
    pub assigned_agent: Option<String>,
    pub blocked_by: Vec<TaskId>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Reason the previous attempt failed; fed into the next attempt's input.
    pub failure_context: Option<String>,
    pub requires_collaboration: bool,
    pub reviewer: Option<String>,
    pub metrics: TaskMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SpecTask {
    pub fn new(
        project_id: ProjectId,
        title: impl Into<String>,
        description: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            project_id,
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            agent_hint: None,
            assigned_agent: None,
            blocked_by: Vec::new(),
            retry_count: 0,
            max_retries,
            failure_context: None,
            requires_collaboration: false,
            reviewer: None,
            metrics: TaskMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_hint(mut self, agent: impl Into<String>) -> Self {
        self.agent_hint = Some(agent.into());
        self
    }

    pub fn blocked_by(mut self, predecessors: impl IntoIterator<Item = TaskId>) -> Self {
        self.blocked_by.extend(predecessors);
        self
    }

    /// Require reviewer approval of a plan before the work runs.
    pub fn collaborative(mut self, reviewer: Option<String>) -> Self {
        self.requires_collaboration = true;
        self.reviewer = reviewer;
        self
    }

    /// Pending, unassigned, and every predecessor is in `completed`.
    pub fn is_ready(&self, completed: &HashSet<TaskId>) -> bool {
        self.status == TaskStatus::Pending
            && self.assigned_agent.is_none()
            && self.blocked_by.iter().all(|id| completed.contains(id))
    }

    pub fn claim(&mut self, agent: impl Into<String>) -> Result<(), TaskError> {
        if self.status != TaskStatus::Pending || self.assigned_agent.is_some() {
            return Err(self.invalid(TaskStatus::InProgress));
        }
        self.status = TaskStatus::InProgress;
        self.assigned_agent = Some(agent.into());
        self.metrics.attempts += 1;
        self.touch();
        Ok(())
    }

    pub fn complete(&mut self, run: &AgentRun, duration_ms: u64) -> Result<(), TaskError> {
        self.expect_in_progress(TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.failure_context = None;
        self.metrics.record_attempt(Some(run), duration_ms);
        self.touch();
        Ok(())
    }

    /// Requeue while retries remain, otherwise fail for good.
    pub fn record_failure(
        &mut self,
        reason: impl Into<String>,
        run: Option<&AgentRun>,
        duration_ms: u64,
    ) -> Result<FailureOutcome, TaskError> {
        self.expect_in_progress(TaskStatus::Failed)?;
        self.failure_context = Some(reason.into());
        self.metrics.record_attempt(run, duration_ms);
        self.touch();
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = TaskStatus::Pending;
            self.assigned_agent = None;
            Ok(FailureOutcome::Requeued {
                retry_count: self.retry_count,
            })
        } else {
            self.status = TaskStatus::Failed;
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// Back to pending without consuming a retry.
    pub fn release(&mut self, run: Option<&AgentRun>, duration_ms: u64) -> Result<(), TaskError> {
        self.expect_in_progress(TaskStatus::Pending)?;
        self.status = TaskStatus::Pending;
        self.assigned_agent = None;
        self.metrics.record_attempt(run, duration_ms);
        self.touch();
        Ok(())
    }

    /// Fail a pending task without running it, e.g. when no agent fits.
    pub fn abandon(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        if self.status != TaskStatus::Pending {
            return Err(self.invalid(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.failure_context = Some(reason.into());
        self.touch();
        Ok(())
    }

    pub fn skip(&mut self) -> Result<(), TaskError> {
        if self.status != TaskStatus::Pending {
            return Err(self.invalid(TaskStatus::Skipped));
        }
        self.status = TaskStatus::Skipped;
        self.touch();
        Ok(())
    }

    /// Input handed to the assigned agent.
    pub fn prompt(&self) -> String {
        let mut prompt = format!("# Task: {}\n\n{}", self.title, self.description);
        if let Some(context) = &self.failure_context {
            prompt.push_str(&format!(
                "\n\n## Previous attempt failed\n\n{context}\n\nAddress this failure in your next attempt."
            ));
        }
        prompt
    }

    fn expect_in_progress(&self, to: TaskStatus) -> Result<(), TaskError> {
        if self.status == TaskStatus::InProgress {
            Ok(())
        } else {
            Err(self.invalid(to))
        }
    }

    fn invalid(&self, to: TaskStatus) -> TaskError {
        TaskError::InvalidTransition {
            task_id: self.id,
            from: self.status,
            to,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
