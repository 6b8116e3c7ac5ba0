// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Tools and Tool Servers
//!
//! A [`Tool`] is anything the model can call during a run. Tools come from two
//! places: per-project tool servers reached through a [`ToolServerConnector`],
//! and the executor's built-in coordination tools (`spawn_agents`,
//! `list_available_agents`).
//!
//! Every call receives a [`ToolContext`] carrying the calling run's identity,
//! its delegation depth, a cancellation token and its concurrency slot.

use crate::domain::agent::ProjectId;
use crate::domain::concurrency::RunSlot;
use crate::domain::run::RunId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const SPAWN_AGENTS_TOOL: &str = "spawn_agents";
pub const LIST_AVAILABLE_AGENTS_TOOL: &str = "list_available_agents";

pub fn is_coordination_tool(name: &str) -> bool {
    name == SPAWN_AGENTS_TOOL || name == LIST_AVAILABLE_AGENTS_TOOL
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the call arguments
    #[serde(default = "empty_object_schema", alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid tool input: {0}")]
    InvalidInput(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool call refused: {0}")]
    Refused(String),

    #[error("Tool call cancelled")]
    Cancelled,

    #[error("Tool server transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::InvalidInput(err.to_string())
    }
}

/// Execution context handed to every tool call.
#[derive(Clone)]
pub struct ToolContext {
    pub project_id: ProjectId,
    pub run_id: RunId,
    pub agent_name: String,
    pub depth: u32,
    pub cancel: CancellationToken,
    pub slot: RunSlot,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Tools that watch `ToolContext::cancel` themselves and always return
    /// promptly once it fires. The executor awaits these to completion instead
    /// of dropping them mid-flight.
    fn observes_cancellation(&self) -> bool {
        false
    }

    async fn call(&self, ctx: &ToolContext, input: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

/// How to launch one tool server for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Values may use `env:VAR` to read from the coordinator's environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A connected tool server.
#[async_trait]
pub trait ToolServerClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn ToolServerClient>, ToolError>;
}
