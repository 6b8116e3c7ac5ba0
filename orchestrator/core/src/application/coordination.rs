// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Coordination Tools
//
// The two built-in tools through which an agent delegates work:
// - list_available_agents: read-only catalog of the project's definitions
// - spawn_agents: run N delegated sub-runs concurrently and collect their results
//
// Every child resolves tools from its own definition and runs one level deeper
// than the caller. The caller's slot is released while it waits.

use crate::application::executor::{AgentExecutor, ExecutionRequest, ExecutorError};
use crate::domain::agent::AgentDefinition;
use crate::domain::repository::DefinitionRegistry;
use crate::domain::run::{AgentRun, RunId, RunStatus};
use crate::domain::tool::{
    Tool, ToolContext, ToolDescriptor, ToolError, LIST_AVAILABLE_AGENTS_TOOL, SPAWN_AGENTS_TOOL,
};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct ListAgentsInput {
    #[serde(default = "default_exclude_self")]
    exclude_self: bool,
}

fn default_exclude_self() -> bool {
    true
}

pub struct ListAvailableAgentsTool {
    descriptor: ToolDescriptor,
    definitions: Arc<dyn DefinitionRegistry>,
}

impl ListAvailableAgentsTool {
    pub fn new(definitions: Arc<dyn DefinitionRegistry>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: LIST_AVAILABLE_AGENTS_TOOL.to_string(),
                description: "List the agents in this project that can be delegated to with spawn_agents, \
                    with their description, flow type and tools."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "exclude_self": {
                            "type": "boolean",
                            "description": "Leave the calling agent out of the list (default true)"
                        }
                    }
                }),
            },
            definitions,
        }
    }
}

#[async_trait]
impl Tool for ListAvailableAgentsTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, ctx: &ToolContext, input: Value) -> Result<Value, ToolError> {
        let input: ListAgentsInput = if input.is_null() {
            ListAgentsInput {
                exclude_self: default_exclude_self(),
            }
        } else {
            serde_json::from_value(input)?
        };

        // Visibility gates external surfaces only; internal discovery sees everything.
        let agents: Vec<_> = self
            .definitions
            .list_definitions(ctx.project_id)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?
            .iter()
            .filter(|d| !(input.exclude_self && d.name == ctx.agent_name))
            .map(AgentDefinition::summary)
            .collect();

        Ok(json!({ "agents": agents }))
    }
}

#[derive(Debug, Deserialize)]
struct SpawnInput {
    tasks: Vec<SpawnTask>,
}

#[derive(Debug, Deserialize)]
struct SpawnTask {
    agent_name: String,
    prompt: String,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    resume_run_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpawnResult {
    pub agent_name: String,
    pub run_id: Option<RunId>,
    pub status: String,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub steps: u32,
}

impl SpawnResult {
    fn from_run(run: &AgentRun) -> Self {
        Self {
            agent_name: run.agent_name.clone(),
            run_id: Some(run.id),
            status: run.status.as_str().to_string(),
            summary: run.summary.clone(),
            error: run.error.clone(),
            steps: run.step_count,
        }
    }

    fn not_started(agent_name: String, error: String) -> Self {
        Self {
            agent_name,
            run_id: None,
            status: RunStatus::Failed.as_str().to_string(),
            summary: None,
            error: Some(error),
            steps: 0,
        }
    }

    /// Paused children produced a usable summary and can be resumed.
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed.as_str() || self.status == RunStatus::Paused.as_str()
    }
}

pub struct SpawnAgentsTool {
    descriptor: ToolDescriptor,
    executor: Arc<AgentExecutor>,
}

impl SpawnAgentsTool {
    pub fn new(executor: Arc<AgentExecutor>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: SPAWN_AGENTS_TOOL.to_string(),
                description: "Run one or more agents concurrently and wait for all of them. Each task names \
                    an agent from list_available_agents and gives it a prompt. Set resume_run_id to continue \
                    a paused run. Returns each run's status and summary."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "required": ["tasks"],
                    "properties": {
                        "tasks": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "required": ["agent_name", "prompt"],
                                "properties": {
                                    "agent_name": { "type": "string" },
                                    "prompt": { "type": "string" },
                                    "timeout": { "type": "string", "description": "e.g. \"90s\" or \"5m\"" },
                                    "resume_run_id": { "type": "string", "format": "uuid" }
                                }
                            }
                        }
                    }
                }),
            },
            executor,
        }
    }

    /// Resolve every task before launching any of them.
    async fn plan(&self, ctx: &ToolContext, tasks: Vec<SpawnTask>) -> Result<Vec<ExecutionRequest>, ToolError> {
        let definitions = self.executor.definitions();
        let runs = self.executor.runs();
        let mut requests = Vec::with_capacity(tasks.len());
        let mut unknown = Vec::new();

        for task in tasks {
            let definition = definitions
                .get_definition(ctx.project_id, &task.agent_name)
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;
            let Some(definition) = definition else {
                unknown.push(task.agent_name);
                continue;
            };

            let mut request = ExecutionRequest::new(definition, task.prompt).delegated_from(
                ctx.run_id,
                ctx.depth,
                ctx.cancel.clone(),
            );
            if let Some(timeout) = task.timeout {
                request = request.with_timeout(timeout);
            }
            if let Some(raw) = task.resume_run_id {
                let prior_id = RunId(raw);
                let prior = runs
                    .find_run(prior_id)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?
                    .ok_or_else(|| ToolError::InvalidInput(format!("run {prior_id} does not exist")))?;
                if prior.agent_name != task.agent_name {
                    return Err(ToolError::InvalidInput(format!(
                        "run {prior_id} belongs to agent '{}', not '{}'",
                        prior.agent_name, task.agent_name
                    )));
                }
                if !prior.status.is_resumable() {
                    return Err(ToolError::InvalidInput(format!(
                        "run {prior_id} is {} and cannot be resumed",
                        prior.status
                    )));
                }
                request = request.resuming(prior_id);
            }
            requests.push(request);
        }

        if !unknown.is_empty() {
            return Err(ToolError::InvalidInput(format!(
                "unknown agents: {}; call {LIST_AVAILABLE_AGENTS_TOOL} to see what exists",
                unknown.join(", ")
            )));
        }
        Ok(requests)
    }
}

#[async_trait]
impl Tool for SpawnAgentsTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    /// Children share the caller's token and wind down on their own.
    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &ToolContext, input: Value) -> Result<Value, ToolError> {
        let input: SpawnInput = serde_json::from_value(input)?;
        if input.tasks.is_empty() {
            return Err(ToolError::InvalidInput("tasks must not be empty".into()));
        }

        let max_depth = self.executor.settings().max_depth;
        if ctx.depth + 1 > max_depth {
            return Err(ToolError::Refused(format!(
                "delegation depth {} would exceed the maximum of {max_depth}",
                ctx.depth + 1
            )));
        }

        let requests = self.plan(ctx, input.tasks).await?;
        info!(
            run_id = %ctx.run_id,
            children = requests.len(),
            depth = ctx.depth + 1,
            "Spawning sub-agents"
        );

        // Detached handles: a dropped parent future does not abort its children.
        let handles: Vec<(String, JoinHandle<Result<AgentRun, ExecutorError>>)> = requests
            .into_iter()
            .map(|request| {
                let name = request.definition.name.clone();
                (name, tokio::spawn(self.executor.execute(request)))
            })
            .collect();

        let results = ctx.slot.suspend(collect_by_completion(handles)).await;

        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        let report = json!({
            "results": results,
            "succeeded": succeeded,
            "failed": results.len() - succeeded,
        });
        if succeeded == 0 {
            warn!(run_id = %ctx.run_id, "Every sub-agent failed");
            return Err(ToolError::Execution(report.to_string()));
        }
        Ok(report)
    }
}

async fn collect_by_completion(
    handles: Vec<(String, JoinHandle<Result<AgentRun, ExecutorError>>)>,
) -> Vec<SpawnResult> {
    let mut pending: FuturesUnordered<_> = handles
        .into_iter()
        .map(|(name, handle)| async move { (name, handle.await) })
        .collect();

    let mut results = Vec::new();
    while let Some((name, joined)) = pending.next().await {
        results.push(match joined {
            Ok(Ok(run)) => SpawnResult::from_run(&run),
            Ok(Err(e)) => SpawnResult::not_started(name, e.to_string()),
            Err(e) => SpawnResult::not_started(name, format!("sub-agent task aborted: {e}")),
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_task_parses_human_timeout() {
        let input: SpawnInput = serde_json::from_value(json!({
            "tasks": [
                {"agent_name": "researcher", "prompt": "find it", "timeout": "90s"},
                {"agent_name": "writer", "prompt": "write it"}
            ]
        }))
        .unwrap();
        assert_eq!(input.tasks[0].timeout, Some(Duration::from_secs(90)));
        assert_eq!(input.tasks[1].timeout, None);
        assert!(input.tasks[1].resume_run_id.is_none());
    }

    #[test]
    fn test_paused_child_counts_as_success() {
        let paused = SpawnResult {
            agent_name: "a".into(),
            run_id: Some(RunId::new()),
            status: "paused".into(),
            summary: Some("half way".into()),
            error: None,
            steps: 50,
        };
        assert!(paused.succeeded());
        assert!(!SpawnResult::not_started("b".into(), "boom".into()).succeeded());
    }

    #[test]
    fn test_list_input_defaults_to_excluding_self() {
        let input: ListAgentsInput = serde_json::from_value(json!({})).unwrap();
        assert!(input.exclude_self);
    }
}
