// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype that is
//! injected into the PostgreSQL repository implementations, and owns the
//! schema those repositories expect.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `agent_runs` | One row per run attempt |
//! | `run_messages` | Append-only conversation, ordered by `seq` |
//! | `run_tool_calls` | One row per tool invocation |

use crate::domain::config::StateStoreConfig;
use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agent_runs (
    id UUID PRIMARY KEY,
    definition_id UUID NOT NULL,
    agent_name TEXT NOT NULL,
    project_id UUID NOT NULL,
    parent_run_id UUID NULL REFERENCES agent_runs(id),
    depth INTEGER NOT NULL,
    status TEXT NOT NULL,
    step_count INTEGER NOT NULL,
    attempt_start_step INTEGER NOT NULL,
    max_steps INTEGER NULL,
    input TEXT NOT NULL,
    summary TEXT NULL,
    error TEXT NULL,
    resumed_from UUID NULL REFERENCES agent_runs(id),
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    ended_at TIMESTAMPTZ NULL
);
CREATE INDEX IF NOT EXISTS agent_runs_project_idx ON agent_runs (project_id, created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS agent_runs_parent_idx ON agent_runs (parent_run_id);

CREATE TABLE IF NOT EXISTS run_messages (
    seq BIGSERIAL PRIMARY KEY,
    id UUID NOT NULL UNIQUE,
    run_id UUID NOT NULL REFERENCES agent_runs(id),
    role TEXT NOT NULL,
    content JSONB NOT NULL,
    step INTEGER NOT NULL,
    usage JSONB NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS run_messages_run_idx ON run_messages (run_id, seq);

CREATE TABLE IF NOT EXISTS run_tool_calls (
    seq BIGSERIAL PRIMARY KEY,
    id UUID NOT NULL UNIQUE,
    run_id UUID NOT NULL REFERENCES agent_runs(id),
    message_id UUID NOT NULL,
    call_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    input JSONB NOT NULL,
    output JSONB NULL,
    status TEXT NOT NULL,
    duration_ms BIGINT NULL,
    step INTEGER NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ NULL
);
CREATE INDEX IF NOT EXISTS run_tool_calls_run_idx ON run_tool_calls (run_id, seq);
"#;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    /// Connect when the state store is postgres; `None` for in-memory.
    pub async fn from_config(config: &StateStoreConfig) -> Result<Option<Self>> {
        match config {
            StateStoreConfig::InMemory => Ok(None),
            StateStoreConfig::Postgres { url, max_connections } => {
                let url = crate::domain::config::resolve_env_value(url)?;
                Ok(Some(Self::new(&url, *max_connections).await?))
            }
        }
    }

    /// Create the run tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("Run store schema is up to date");
        Ok(())
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}
