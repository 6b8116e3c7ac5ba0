// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::agent::ProjectId;
use crate::domain::run::{RunId, ToolCallId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run lifecycle events emitted by the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        project_id: ProjectId,
        agent_name: String,
        parent_run_id: Option<RunId>,
        depth: u32,
        resumed_from: Option<RunId>,
        started_at: DateTime<Utc>,
    },
    StepStarted {
        run_id: RunId,
        step: u32,
        started_at: DateTime<Utc>,
    },
    ToolCallStarted {
        run_id: RunId,
        tool_call_id: ToolCallId,
        tool_name: String,
        started_at: DateTime<Utc>,
    },
    ToolCallFinished {
        run_id: RunId,
        tool_call_id: ToolCallId,
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
        finished_at: DateTime<Utc>,
    },
    GovernorTriggered {
        run_id: RunId,
        reason: String,
        triggered_at: DateTime<Utc>,
    },
    RunPaused {
        run_id: RunId,
        summary: String,
        paused_at: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        step_count: u32,
        completed_at: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        error: String,
        failed_at: DateTime<Utc>,
    },
    RunCancelled {
        run_id: RunId,
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::ToolCallStarted { run_id, .. }
            | RunEvent::ToolCallFinished { run_id, .. }
            | RunEvent::GovernorTriggered { run_id, .. }
            | RunEvent::RunPaused { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunFailed { run_id, .. }
            | RunEvent::RunCancelled { run_id, .. } => *run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunPaused { .. }
                | RunEvent::RunCompleted { .. }
                | RunEvent::RunFailed { .. }
                | RunEvent::RunCancelled { .. }
        )
    }
}

/// Task and discussion events emitted by the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskDispatched {
        task_id: Uuid,
        project_id: ProjectId,
        agent_name: String,
        attempt: u32,
        dispatched_at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: Uuid,
        run_id: RunId,
        completed_at: DateTime<Utc>,
    },
    TaskRequeued {
        task_id: Uuid,
        retry_count: u32,
        reason: String,
        requeued_at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: Uuid,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    TaskSkipped {
        task_id: Uuid,
        blocked_by: Uuid,
        skipped_at: DateTime<Utc>,
    },
    DiscussionEscalated {
        discussion_id: Uuid,
        task_id: Uuid,
        reason: String,
        escalated_at: DateTime<Utc>,
    },
}
