// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Trigger Service
//!
//! Entry points that start top-level runs (depth 0):
//!
//! 1. manual invocation of one definition
//! 2. a named project event, fanned out to every definition listening for it
//! 3. schedule triggers, which are only surfaced here; an external scheduler
//!    evaluates the expressions and calls [`TriggerService::trigger`]

use crate::application::executor::{AgentExecutor, ExecutionRequest, ExecutorError};
use crate::domain::agent::{AgentDefinitionId, ProjectId, Trigger};
use crate::domain::run::AgentRun;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// A definition that wants to be started on a schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledDefinition {
    pub definition_id: AgentDefinitionId,
    pub name: String,
    pub expression: String,
}

#[async_trait]
pub trait TriggerService: Send + Sync {
    /// Run one definition version to completion.
    async fn trigger(&self, definition_id: AgentDefinitionId, input: &str) -> Result<AgentRun, ExecutorError>;

    /// Run the latest version of a named definition.
    async fn trigger_by_name(&self, project: ProjectId, name: &str, input: &str) -> Result<AgentRun, ExecutorError>;

    /// Run every definition listening for `event_name`, concurrently. A
    /// definition that cannot start is logged and left out of the result.
    async fn fire_event(
        &self,
        project: ProjectId,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<AgentRun>, ExecutorError>;

    async fn scheduled_definitions(&self, project: ProjectId) -> Result<Vec<ScheduledDefinition>, ExecutorError>;
}

pub struct StandardTriggerService {
    executor: Arc<AgentExecutor>,
}

impl StandardTriggerService {
    pub fn new(executor: Arc<AgentExecutor>) -> Self {
        Self { executor }
    }
}

fn event_input(event_name: &str, payload: &serde_json::Value) -> String {
    let body = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
    format!("Event `{event_name}` fired with payload:\n{body}")
}

#[async_trait]
impl TriggerService for StandardTriggerService {
    async fn trigger(&self, definition_id: AgentDefinitionId, input: &str) -> Result<AgentRun, ExecutorError> {
        let definition = self
            .executor
            .definitions()
            .get_definition_by_id(definition_id)
            .await?
            .ok_or_else(|| ExecutorError::DefinitionNotFound(definition_id.to_string()))?;

        info!(agent = %definition.name, version = definition.version, "Manual trigger");
        self.executor.execute(ExecutionRequest::new(definition, input)).await
    }

    async fn trigger_by_name(&self, project: ProjectId, name: &str, input: &str) -> Result<AgentRun, ExecutorError> {
        let definition = self
            .executor
            .definitions()
            .get_definition(project, name)
            .await?
            .ok_or_else(|| ExecutorError::DefinitionNotFound(name.to_string()))?;

        info!(agent = %definition.name, version = definition.version, "Manual trigger");
        self.executor.execute(ExecutionRequest::new(definition, input)).await
    }

    async fn fire_event(
        &self,
        project: ProjectId,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<AgentRun>, ExecutorError> {
        let listeners: Vec<_> = self
            .executor
            .definitions()
            .list_definitions(project)
            .await?
            .into_iter()
            .filter(|d| d.responds_to_event(event_name))
            .collect();

        info!(%project, event = event_name, listeners = listeners.len(), "Event fired");
        let input = event_input(event_name, &payload);
        let outcomes = join_all(
            listeners
                .into_iter()
                .map(|definition| self.executor.execute(ExecutionRequest::new(definition, input.clone()))),
        )
        .await;

        Ok(outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Ok(run) => Some(run),
                Err(e) => {
                    warn!(event = event_name, error = %e, "Event listener could not start");
                    None
                }
            })
            .collect())
    }

    async fn scheduled_definitions(&self, project: ProjectId) -> Result<Vec<ScheduledDefinition>, ExecutorError> {
        Ok(self
            .executor
            .definitions()
            .list_definitions(project)
            .await?
            .into_iter()
            .filter_map(|d| match &d.trigger {
                Trigger::Schedule { expression } => Some(ScheduledDefinition {
                    definition_id: d.id,
                    name: d.name.clone(),
                    expression: expression.clone(),
                }),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_input_includes_payload() {
        let input = event_input("pr_opened", &json!({"number": 42}));
        assert!(input.starts_with("Event `pr_opened` fired"));
        assert!(input.contains("\"number\": 42"));
    }
}
