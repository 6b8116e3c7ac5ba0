// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Runs
//!
//! [`AgentRun`] is the aggregate for one execution of one [`AgentDefinition`]:
//! its place in the delegation tree, its step counter and its final status.
//! The conversation it produced is stored as append-only [`RunMessage`]s, and
//! every tool invocation as a [`ToolCallRecord`].
//!
//! ## Status machine
//!
//! ```text
//! running ──► completed
//!    │──────► failed
//!    │──────► paused      (governor stop, resumable)
//!    └──────► cancelled
//! ```
//!
//! A run leaves `running` exactly once. Resuming a paused or failed run never
//! mutates it; [`AgentRun::resume`] creates a new run linked by `resumed_from`.
//!
//! [`AgentDefinition`]: crate::domain::agent::AgentDefinition

use crate::domain::agent::{AgentDefinition, AgentDefinitionId, ProjectId};
use crate::domain::llm::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallId(pub Uuid);

impl ToolCallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ToolCallId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "paused" => Some(RunStatus::Paused),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Paused | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("Maximum delegation depth exceeded: depth {depth} > max {max}")]
    MaxDepthExceeded { depth: u32, max: u32 },

    #[error("Run is not running (status: {0})")]
    NotRunning(RunStatus),

    #[error("Run cannot be resumed from status {0}")]
    NotResumable(RunStatus),

    #[error("Run already used {steps} steps of the {ceiling} step ceiling")]
    StepCeilingReached { steps: u32, ceiling: u32 },

    #[error("Invalid tool call transition from {from} to {to}")]
    InvalidToolCallTransition {
        from: ToolCallStatus,
        to: ToolCallStatus,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: RunId,
    pub definition_id: AgentDefinitionId,
    pub agent_name: String,
    pub project_id: ProjectId,
    pub parent_run_id: Option<RunId>,
    pub depth: u32,
    pub status: RunStatus,
    /// Steps taken across the whole resume lineage.
    pub step_count: u32,
    /// `step_count` at the start of this attempt.
    pub attempt_start_step: u32,
    /// Step budget for this attempt; `None` means only the global ceiling applies.
    pub max_steps: Option<u32>,
    pub input: String,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub resumed_from: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    pub fn new(definition: &AgentDefinition, input: impl Into<String>, max_steps: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            definition_id: definition.id,
            agent_name: definition.name.clone(),
            project_id: definition.project_id,
            parent_run_id: None,
            depth: 0,
            status: RunStatus::Running,
            step_count: 0,
            attempt_start_step: 0,
            max_steps,
            input: input.into(),
            summary: None,
            error: None,
            resumed_from: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Create a delegated run one level below `parent`.
    pub fn new_child(
        definition: &AgentDefinition,
        input: impl Into<String>,
        max_steps: Option<u32>,
        parent: RunId,
        parent_depth: u32,
        max_depth: u32,
    ) -> Result<Self, RunError> {
        let depth = parent_depth + 1;
        if depth > max_depth {
            return Err(RunError::MaxDepthExceeded {
                depth,
                max: max_depth,
            });
        }
        let mut run = Self::new(definition, input, max_steps);
        run.parent_run_id = Some(parent);
        run.depth = depth;
        Ok(run)
    }

    /// Start a new attempt that continues `prior`. The step counter carries
    /// over; the per-attempt budget is fresh.
    pub fn resume(
        prior: &AgentRun,
        definition: &AgentDefinition,
        input: impl Into<String>,
        max_steps: Option<u32>,
        ceiling: u32,
    ) -> Result<Self, RunError> {
        if !prior.status.is_resumable() {
            return Err(RunError::NotResumable(prior.status));
        }
        if prior.step_count >= ceiling {
            return Err(RunError::StepCeilingReached {
                steps: prior.step_count,
                ceiling,
            });
        }
        let mut run = Self::new(definition, input, max_steps);
        run.parent_run_id = prior.parent_run_id;
        run.depth = prior.depth;
        run.step_count = prior.step_count;
        run.attempt_start_step = prior.step_count;
        run.resumed_from = Some(prior.id);
        Ok(run)
    }

    pub fn steps_this_attempt(&self) -> u32 {
        self.step_count - self.attempt_start_step
    }

    /// Count one model turn and return the new lineage step number.
    pub fn record_step(&mut self) -> Result<u32, RunError> {
        self.ensure_running()?;
        self.step_count += 1;
        self.updated_at = Utc::now();
        Ok(self.step_count)
    }

    pub fn complete(&mut self, summary: impl Into<String>) -> Result<(), RunError> {
        self.finish(RunStatus::Completed)?;
        self.summary = Some(summary.into());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), RunError> {
        self.finish(RunStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Governor stop. The summary is what a parent or a human sees, so it is
    /// always non-empty.
    pub fn pause(&mut self, summary: impl Into<String>) -> Result<(), RunError> {
        let summary = summary.into();
        self.finish(RunStatus::Paused)?;
        self.summary = Some(if summary.trim().is_empty() {
            format!("Paused after {} steps without a summary.", self.step_count)
        } else {
            summary
        });
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), RunError> {
        self.finish(RunStatus::Cancelled)?;
        self.error = Some(reason.into());
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), RunError> {
        if self.status.is_terminal() {
            return Err(RunError::NotRunning(self.status));
        }
        Ok(())
    }

    fn finish(&mut self, status: RunStatus) -> Result<(), RunError> {
        self.ensure_running()?;
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.ended_at = Some(now);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    ToolResult,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::ToolResult => "tool_result",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool_result" => Some(MessageRole::ToolResult),
            _ => None,
        }
    }
}

/// A tool invocation requested by the model in an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call id, echoed back in the matching tool result.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

/// One entry of the history handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: MessageContent,
}

impl ConversationMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(MessageRole::User, text)
    }

    pub fn assistant(text: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent {
                text,
                tool_calls,
                ..Default::default()
            },
        }
    }

    pub fn tool_result(call_id: impl Into<String>, body: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: MessageRole::ToolResult,
            content: MessageContent {
                text: Some(body.into()),
                tool_call_id: Some(call_id.into()),
                is_error,
                ..Default::default()
            },
        }
    }

    fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent {
                text: Some(text.into()),
                ..Default::default()
            },
        }
    }

    pub fn text_content(&self) -> &str {
        self.content.text.as_deref().unwrap_or("")
    }
}

/// Persisted form of a [`ConversationMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMessage {
    pub id: MessageId,
    pub run_id: RunId,
    pub role: MessageRole,
    pub content: MessageContent,
    pub step: u32,
    /// Token usage reported for the model call that produced this message.
    pub usage: Option<TokenUsage>,
    pub created_at: DateTime<Utc>,
}

impl RunMessage {
    pub fn new(run_id: RunId, step: u32, message: ConversationMessage) -> Self {
        Self {
            id: MessageId::new(),
            run_id,
            role: message.role,
            content: message.content,
            step,
            usage: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn to_conversation(&self) -> ConversationMessage {
        ConversationMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Running => "running",
            ToolCallStatus::Completed => "completed",
            ToolCallStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ToolCallStatus::Running),
            "completed" => Some(ToolCallStatus::Completed),
            "error" => Some(ToolCallStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: ToolCallId,
    pub run_id: RunId,
    /// Assistant message that requested the call.
    pub message_id: MessageId,
    pub call_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub status: ToolCallStatus,
    pub duration_ms: Option<u64>,
    pub step: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolCallRecord {
    pub fn start(run_id: RunId, message_id: MessageId, step: u32, request: &ToolCallRequest) -> Self {
        Self {
            id: ToolCallId::new(),
            run_id,
            message_id,
            call_id: request.id.clone(),
            tool_name: request.name.clone(),
            input: request.arguments.clone(),
            output: None,
            status: ToolCallStatus::Running,
            duration_ms: None,
            step,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A call that was refused before execution is recorded directly as an error.
    pub fn refused(
        run_id: RunId,
        message_id: MessageId,
        step: u32,
        request: &ToolCallRequest,
        reason: &str,
    ) -> Self {
        let mut record = Self::start(run_id, message_id, step, request);
        record.status = ToolCallStatus::Error;
        record.output = Some(serde_json::json!({ "error": reason }));
        record.duration_ms = Some(0);
        record.finished_at = Some(record.created_at);
        record
    }

    pub fn complete(&mut self, output: serde_json::Value, duration_ms: u64) -> Result<(), RunError> {
        self.finish(ToolCallStatus::Completed, output, duration_ms)
    }

    pub fn fail(&mut self, error: impl Into<String>, duration_ms: u64) -> Result<(), RunError> {
        let output = serde_json::json!({ "error": error.into() });
        self.finish(ToolCallStatus::Error, output, duration_ms)
    }

    fn finish(
        &mut self,
        status: ToolCallStatus,
        output: serde_json::Value,
        duration_ms: u64,
    ) -> Result<(), RunError> {
        if self.status != ToolCallStatus::Running {
            return Err(RunError::InvalidToolCallTransition {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.output = Some(output);
        self.duration_ms = Some(duration_ms);
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}
