// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for runs and agent definitions. Interfaces live in
//! the domain layer; implementations in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `RunRepository` | `AgentRun` + messages + tool calls | `InMemoryRunRepository`, `PostgresRunRepository` |
//! | `DefinitionRegistry` | `AgentDefinition` | `InMemoryDefinitionRegistry` |
//!
//! ## Write rules
//!
//! - Messages and tool call records are append-only.
//! - `update_run` is rejected with [`RepositoryError::Conflict`] once the
//!   stored run has left `running`.
//! - `update_tool_call` is rejected unless the stored record is `running`.
//!
//! ## Pagination
//!
//! List operations take a [`PageRequest`] and return a [`Page`] whose
//! `next_cursor` encodes `(created_at, id)` of the last item. Runs are
//! ordered by that pair. Messages and tool calls are listed in append order,
//! the same order `load_conversation` replays, and their cursor resumes after
//! the row it names.

use crate::domain::agent::{AgentDefinition, AgentDefinitionId, ProjectId};
use crate::domain::run::{AgentRun, RunId, RunMessage, RunStatus, ToolCallId, ToolCallRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        RepositoryError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

/// Position in a listing: `(created_at, id)` of the last item returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn encode(&self) -> String {
        format!("{}|{}", self.created_at.to_rfc3339(), self.id)
    }

    pub fn decode(raw: &str) -> Result<Self, RepositoryError> {
        let (ts, id) = raw
            .split_once('|')
            .ok_or_else(|| RepositoryError::InvalidCursor(raw.to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| RepositoryError::InvalidCursor(raw.to_string()))?
            .with_timezone(&Utc);
        let id = Uuid::parse_str(id).map_err(|_| RepositoryError::InvalidCursor(raw.to_string()))?;
        Ok(Self { created_at, id })
    }

    pub fn key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            cursor: None,
            limit: Some(limit),
        }
    }

    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            cursor: Some(cursor.into()),
            limit: Some(limit),
        }
    }

    /// Requested size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn decoded_cursor(&self) -> Result<Option<Cursor>, RepositoryError> {
        self.cursor.as_deref().map(Cursor::decode).transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Build a page from up to `limit + 1` fetched items; the extra item only
    /// signals that another page exists.
    pub fn from_overfetch(mut items: Vec<T>, limit: usize, key: impl Fn(&T) -> Cursor) -> Self {
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items.last().map(|last| key(last).encode())
        } else {
            None
        };
        Self { items, next_cursor }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
}

impl RunFilter {
    pub fn matches(&self, run: &AgentRun) -> bool {
        self.project_id.is_none_or(|p| p == run.project_id)
            && self.status.is_none_or(|s| s == run.status)
            && self.agent_name.as_deref().is_none_or(|n| n == run.agent_name)
            && self.parent_run_id.is_none_or(|p| Some(p) == run.parent_run_id)
    }
}

pub fn run_cursor(run: &AgentRun) -> Cursor {
    Cursor {
        created_at: run.created_at,
        id: run.id.0,
    }
}

pub fn message_cursor(message: &RunMessage) -> Cursor {
    Cursor {
        created_at: message.created_at,
        id: message.id.0,
    }
}

pub fn tool_call_cursor(record: &ToolCallRecord) -> Cursor {
    Cursor {
        created_at: record.created_at,
        id: record.id.0,
    }
}

/// Repository interface for agent runs and their conversation
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, run: &AgentRun) -> Result<(), RepositoryError>;

    /// Rejected once the stored run is no longer `running`
    async fn update_run(&self, run: &AgentRun) -> Result<(), RepositoryError>;

    async fn find_run(&self, id: RunId) -> Result<Option<AgentRun>, RepositoryError>;

    /// Newest first
    async fn list_runs(&self, filter: &RunFilter, page: &PageRequest) -> Result<Page<AgentRun>, RepositoryError>;

    async fn find_children(&self, parent: RunId) -> Result<Vec<AgentRun>, RepositoryError>;

    async fn append_message(&self, message: &RunMessage) -> Result<(), RepositoryError>;

    /// Every message of one run, in append order
    async fn load_conversation(&self, run_id: RunId) -> Result<Vec<RunMessage>, RepositoryError>;

    /// Append order, matching `load_conversation`
    async fn list_messages(&self, run_id: RunId, page: &PageRequest) -> Result<Page<RunMessage>, RepositoryError>;

    async fn append_tool_call(&self, record: &ToolCallRecord) -> Result<(), RepositoryError>;

    /// Rejected unless the stored record is still `running`
    async fn update_tool_call(&self, record: &ToolCallRecord) -> Result<(), RepositoryError>;

    async fn find_tool_call(&self, id: ToolCallId) -> Result<Option<ToolCallRecord>, RepositoryError>;

    /// Append order
    async fn list_tool_calls(&self, run_id: RunId, page: &PageRequest) -> Result<Page<ToolCallRecord>, RepositoryError>;
}

/// Conversation of a run together with every run it resumed from, oldest
/// attempt first.
pub async fn load_lineage_conversation(
    runs: &dyn RunRepository,
    run_id: RunId,
) -> Result<Vec<RunMessage>, RepositoryError> {
    let mut chain = Vec::new();
    let mut cursor = Some(run_id);
    while let Some(id) = cursor {
        if chain.contains(&id) {
            return Err(RepositoryError::Conflict(format!("resume cycle at run {id}")));
        }
        let run = runs
            .find_run(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("run {id}")))?;
        chain.push(id);
        cursor = run.resumed_from;
    }

    let mut messages = Vec::new();
    for id in chain.into_iter().rev() {
        messages.extend(runs.load_conversation(id).await?);
    }
    Ok(messages)
}

/// Read access to agent definitions, always at their latest version
#[async_trait]
pub trait DefinitionRegistry: Send + Sync {
    async fn list_definitions(&self, project: ProjectId) -> Result<Vec<AgentDefinition>, RepositoryError>;

    async fn get_definition(&self, project: ProjectId, name: &str) -> Result<Option<AgentDefinition>, RepositoryError>;

    /// Any version, addressed by its id
    async fn get_definition_by_id(&self, id: AgentDefinitionId) -> Result<Option<AgentDefinition>, RepositoryError>;

    /// Store a definition; rejected unless it is newer than the current version
    async fn register(&self, definition: AgentDefinition) -> Result<(), RepositoryError>;
}

/// Definitions other projects may reach, with their exposure metadata.
pub async fn externally_visible(
    registry: &dyn DefinitionRegistry,
    project: ProjectId,
) -> Result<Vec<AgentDefinition>, RepositoryError> {
    Ok(registry
        .list_definitions(project)
        .await?
        .into_iter()
        .filter(|d| d.visibility == crate::domain::agent::Visibility::External && d.exposure.is_some())
        .collect())
}
