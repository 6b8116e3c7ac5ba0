// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::agent::{AgentDefinitionId, ProjectId};
use crate::domain::llm::TokenUsage;
use crate::domain::repository::{
    message_cursor, run_cursor, tool_call_cursor, Page, PageRequest, RepositoryError, RunFilter,
    RunRepository,
};
use crate::domain::run::{
    AgentRun, MessageContent, MessageId, MessageRole, RunId, RunMessage, RunStatus, ToolCallId,
    ToolCallRecord, ToolCallStatus,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

const RUN_COLUMNS: &str = "id, definition_id, agent_name, project_id, parent_run_id, depth, status, \
step_count, attempt_start_step, max_steps, input, summary, error, resumed_from, created_at, updated_at, ended_at";

const TOOL_CALL_COLUMNS: &str = "id, run_id, message_id, call_id, tool_name, input, output, status, \
duration_ms, step, created_at, finished_at";

pub struct PostgresRunRepository {
    pool: PgPool,
}

impl PostgresRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn run_from_row(row: &PgRow) -> Result<AgentRun, RepositoryError> {
        let status: String = row.get("status");
        Ok(AgentRun {
            id: RunId(row.get("id")),
            definition_id: AgentDefinitionId(row.get("definition_id")),
            agent_name: row.get("agent_name"),
            project_id: ProjectId(row.get("project_id")),
            parent_run_id: row.get::<Option<Uuid>, _>("parent_run_id").map(RunId),
            depth: row.get::<i32, _>("depth") as u32,
            status: RunStatus::parse(&status)
                .ok_or_else(|| RepositoryError::Serialization(format!("unknown run status '{status}'")))?,
            step_count: row.get::<i32, _>("step_count") as u32,
            attempt_start_step: row.get::<i32, _>("attempt_start_step") as u32,
            max_steps: row.get::<Option<i32>, _>("max_steps").map(|v| v as u32),
            input: row.get("input"),
            summary: row.get("summary"),
            error: row.get("error"),
            resumed_from: row.get::<Option<Uuid>, _>("resumed_from").map(RunId),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            ended_at: row.get("ended_at"),
        })
    }

    fn message_from_row(row: &PgRow) -> Result<RunMessage, RepositoryError> {
        let role: String = row.get("role");
        let content: MessageContent = serde_json::from_value(row.get("content"))?;
        let usage: Option<TokenUsage> = row
            .get::<Option<serde_json::Value>, _>("usage")
            .map(serde_json::from_value)
            .transpose()?;
        Ok(RunMessage {
            id: MessageId(row.get("id")),
            run_id: RunId(row.get("run_id")),
            role: MessageRole::parse(&role)
                .ok_or_else(|| RepositoryError::Serialization(format!("unknown message role '{role}'")))?,
            content,
            step: row.get::<i32, _>("step") as u32,
            usage,
            created_at: row.get("created_at"),
        })
    }

    fn tool_call_from_row(row: &PgRow) -> Result<ToolCallRecord, RepositoryError> {
        let status: String = row.get("status");
        Ok(ToolCallRecord {
            id: ToolCallId(row.get("id")),
            run_id: RunId(row.get("run_id")),
            message_id: MessageId(row.get("message_id")),
            call_id: row.get("call_id"),
            tool_name: row.get("tool_name"),
            input: row.get("input"),
            output: row.get("output"),
            status: ToolCallStatus::parse(&status)
                .ok_or_else(|| RepositoryError::Serialization(format!("unknown tool call status '{status}'")))?,
            duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|v| v as u64),
            step: row.get::<i32, _>("step") as u32,
            created_at: row.get("created_at"),
            finished_at: row.get("finished_at"),
        })
    }
}

#[async_trait]
impl RunRepository for PostgresRunRepository {
    async fn create_run(&self, run: &AgentRun) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO agent_runs (
                id, definition_id, agent_name, project_id, parent_run_id, depth, status,
                step_count, attempt_start_step, max_steps, input, summary, error,
                resumed_from, created_at, updated_at, ended_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(run.id.0)
        .bind(run.definition_id.0)
        .bind(&run.agent_name)
        .bind(run.project_id.0)
        .bind(run.parent_run_id.map(|id| id.0))
        .bind(run.depth as i32)
        .bind(run.status.as_str())
        .bind(run.step_count as i32)
        .bind(run.attempt_start_step as i32)
        .bind(run.max_steps.map(|v| v as i32))
        .bind(&run.input)
        .bind(&run.summary)
        .bind(&run.error)
        .bind(run.resumed_from.map(|id| id.0))
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run: &AgentRun) -> Result<(), RepositoryError> {
        // Conditional write: only a running row may change.
        let result = sqlx::query(
            r#"
            UPDATE agent_runs SET
                status = $2,
                step_count = $3,
                summary = $4,
                error = $5,
                updated_at = $6,
                ended_at = $7
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run.id.0)
        .bind(run.status.as_str())
        .bind(run.step_count as i32)
        .bind(&run.summary)
        .bind(&run.error)
        .bind(run.updated_at)
        .bind(run.ended_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_run(run.id).await? {
                Some(stored) => Err(RepositoryError::Conflict(format!(
                    "run {} is {} and can no longer change",
                    run.id, stored.status
                ))),
                None => Err(RepositoryError::NotFound(format!("run {}", run.id))),
            };
        }
        Ok(())
    }

    async fn find_run(&self, id: RunId) -> Result<Option<AgentRun>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM agent_runs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter, page: &PageRequest) -> Result<Page<AgentRun>, RepositoryError> {
        let cursor = page.decoded_cursor()?;
        let limit = page.effective_limit();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM agent_runs
            WHERE ($1::uuid IS NULL OR project_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR agent_name = $3)
              AND ($4::uuid IS NULL OR parent_run_id = $4)
              AND ($5::timestamptz IS NULL OR (created_at, id) < ($5, $6))
            ORDER BY created_at DESC, id DESC
            LIMIT $7
            "#
        ))
        .bind(filter.project_id.map(|p| p.0))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.agent_name.as_deref())
        .bind(filter.parent_run_id.map(|p| p.0))
        .bind(cursor.map(|c| c.created_at))
        .bind(cursor.map(|c| c.id))
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let runs = rows.iter().map(Self::run_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetch(runs, limit, run_cursor))
    }

    async fn find_children(&self, parent: RunId) -> Result<Vec<AgentRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM agent_runs WHERE parent_run_id = $1 ORDER BY created_at, id"
        ))
        .bind(parent.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn append_message(&self, message: &RunMessage) -> Result<(), RepositoryError> {
        let content = serde_json::to_value(&message.content)?;
        let usage = message.usage.map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO run_messages (id, run_id, role, content, step, usage, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.id.0)
        .bind(message.run_id.0)
        .bind(message.role.as_str())
        .bind(content)
        .bind(message.step as i32)
        .bind(usage)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_conversation(&self, run_id: RunId) -> Result<Vec<RunMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, run_id, role, content, step, usage, created_at FROM run_messages WHERE run_id = $1 ORDER BY seq",
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::message_from_row).collect()
    }

    async fn list_messages(&self, run_id: RunId, page: &PageRequest) -> Result<Page<RunMessage>, RepositoryError> {
        let cursor = page.decoded_cursor()?;
        let limit = page.effective_limit();
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, role, content, step, usage, created_at FROM run_messages
            WHERE run_id = $1
              AND ($2::uuid IS NULL OR seq > (SELECT seq FROM run_messages WHERE id = $2))
            ORDER BY seq
            LIMIT $3
            "#,
        )
        .bind(run_id.0)
        .bind(cursor.map(|c| c.id))
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows.iter().map(Self::message_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetch(messages, limit, message_cursor))
    }

    async fn append_tool_call(&self, record: &ToolCallRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO run_tool_calls (
                id, run_id, message_id, call_id, tool_name, input, output, status,
                duration_ms, step, created_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id.0)
        .bind(record.run_id.0)
        .bind(record.message_id.0)
        .bind(&record.call_id)
        .bind(&record.tool_name)
        .bind(&record.input)
        .bind(&record.output)
        .bind(record.status.as_str())
        .bind(record.duration_ms.map(|v| v as i64))
        .bind(record.step as i32)
        .bind(record.created_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_tool_call(&self, record: &ToolCallRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE run_tool_calls SET
                output = $2,
                status = $3,
                duration_ms = $4,
                finished_at = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(record.id.0)
        .bind(&record.output)
        .bind(record.status.as_str())
        .bind(record.duration_ms.map(|v| v as i64))
        .bind(record.finished_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "tool call {} is missing or already finished",
                record.id.0
            )));
        }
        Ok(())
    }

    async fn find_tool_call(&self, id: ToolCallId) -> Result<Option<ToolCallRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TOOL_CALL_COLUMNS} FROM run_tool_calls WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::tool_call_from_row).transpose()
    }

    async fn list_tool_calls(&self, run_id: RunId, page: &PageRequest) -> Result<Page<ToolCallRecord>, RepositoryError> {
        let cursor = page.decoded_cursor()?;
        let limit = page.effective_limit();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TOOL_CALL_COLUMNS} FROM run_tool_calls
            WHERE run_id = $1
              AND ($2::uuid IS NULL OR seq > (SELECT seq FROM run_tool_calls WHERE id = $2))
            ORDER BY seq
            LIMIT $3
            "#
        ))
        .bind(run_id.0)
        .bind(cursor.map(|c| c.id))
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let records = rows.iter().map(Self::tool_call_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetch(records, limit, tool_call_cursor))
    }
}
