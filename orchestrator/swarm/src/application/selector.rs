// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Agent Selection
//
// Strategies that match a task to one agent definition from the project
// catalog. The dispatcher only sees the `AgentSelector` trait.
//
// - RuleBasedSelector: agent hint, then ordered substring rules. No model cost.
// - ModelBasedSelector: a single model call over the task and the catalog.
// - HybridSelector: rules first, model on no match.

use crate::domain::task::SpecTask;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchyard_core::domain::agent::AgentDefinition;
use switchyard_core::domain::llm::{LLMError, ModelProvider};
use switchyard_core::domain::run::ConversationMessage;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("No agents are defined for this project")]
    EmptyCatalog,

    #[error("No agent matches task '{0}'")]
    NoMatch(String),

    #[error("Selector model failed: {0}")]
    Model(#[from] LLMError),
}

#[async_trait]
pub trait AgentSelector: Send + Sync {
    async fn select(&self, task: &SpecTask, catalog: &[AgentDefinition]) -> Result<AgentDefinition, SelectionError>;
}

/// `pattern` is a case-insensitive substring of the task title or
/// description, or `*` to match anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRule {
    pub pattern: String,
    pub agent: String,
}

impl SelectionRule {
    pub fn new(pattern: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            agent: agent.into(),
        }
    }

    fn matches(&self, haystack: &str) -> bool {
        self.pattern == "*" || haystack.contains(&self.pattern.to_lowercase())
    }
}

fn find<'a>(catalog: &'a [AgentDefinition], name: &str) -> Option<&'a AgentDefinition> {
    catalog.iter().find(|d| d.name == name)
}

#[derive(Debug, Clone, Default)]
pub struct RuleBasedSelector {
    rules: Vec<SelectionRule>,
}

impl RuleBasedSelector {
    pub fn new(rules: Vec<SelectionRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl AgentSelector for RuleBasedSelector {
    async fn select(&self, task: &SpecTask, catalog: &[AgentDefinition]) -> Result<AgentDefinition, SelectionError> {
        if catalog.is_empty() {
            return Err(SelectionError::EmptyCatalog);
        }
        if let Some(hinted) = task.agent_hint.as_deref().and_then(|name| find(catalog, name)) {
            return Ok(hinted.clone());
        }

        let haystack = format!("{}\n{}", task.title, task.description).to_lowercase();
        self.rules
            .iter()
            .filter(|rule| rule.matches(&haystack))
            // Rules naming an agent the project lacks are passed over.
            .find_map(|rule| find(catalog, &rule.agent))
            .cloned()
            .ok_or_else(|| SelectionError::NoMatch(task.title.clone()))
    }
}

const SELECTOR_SYSTEM_PROMPT: &str = "You assign tasks to agents. Reply with the name of exactly one agent \
from the catalog and nothing else.";

pub struct ModelBasedSelector {
    model: Arc<dyn ModelProvider>,
    model_name: String,
}

impl ModelBasedSelector {
    pub fn new(model: Arc<dyn ModelProvider>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

#[async_trait]
impl AgentSelector for ModelBasedSelector {
    async fn select(&self, task: &SpecTask, catalog: &[AgentDefinition]) -> Result<AgentDefinition, SelectionError> {
        if catalog.is_empty() {
            return Err(SelectionError::EmptyCatalog);
        }

        let mut request = format!("Task: {}\n{}\n\nAgents:\n", task.title, task.description);
        for definition in catalog {
            request.push_str(&format!("- {}: {}\n", definition.name, definition.description));
        }

        let response = self
            .model
            .invoke(
                &self.model_name,
                SELECTOR_SYSTEM_PROMPT,
                &[ConversationMessage::user(request)],
                &[],
            )
            .await?;
        let reply = response.text.unwrap_or_default();
        debug!(task = %task.title, reply = %reply, "Selector model replied");

        named_in(&reply, catalog)
            .cloned()
            .ok_or_else(|| SelectionError::NoMatch(task.title.clone()))
    }
}

/// The catalog agent a free-text reply names. An exact reply wins; otherwise
/// the earliest mention, preferring the longer name when two start together.
fn named_in<'a>(reply: &str, catalog: &'a [AgentDefinition]) -> Option<&'a AgentDefinition> {
    let trimmed = reply.trim().trim_matches(|c: char| c == '`' || c == '"' || c == '.');
    if let Some(exact) = find(catalog, trimmed) {
        return Some(exact);
    }
    catalog
        .iter()
        .filter_map(|d| reply.find(d.name.as_str()).map(|pos| (pos, d)))
        .min_by(|(a_pos, a), (b_pos, b)| a_pos.cmp(b_pos).then(b.name.len().cmp(&a.name.len())))
        .map(|(_, d)| d)
}

pub struct HybridSelector {
    rules: RuleBasedSelector,
    model: ModelBasedSelector,
}

impl HybridSelector {
    pub fn new(rules: RuleBasedSelector, model: ModelBasedSelector) -> Self {
        Self { rules, model }
    }
}

#[async_trait]
impl AgentSelector for HybridSelector {
    async fn select(&self, task: &SpecTask, catalog: &[AgentDefinition]) -> Result<AgentDefinition, SelectionError> {
        match self.rules.select(task, catalog).await {
            Err(SelectionError::NoMatch(_)) => {
                debug!(task = %task.title, "No rule matched, asking the selector model");
                self.model.select(task, catalog).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::domain::agent::ProjectId;
    use switchyard_core::domain::llm::ModelResponse;
    use switchyard_core::domain::tool::ToolDescriptor;
    use tokio::sync::Mutex;

    fn catalog() -> (ProjectId, Vec<AgentDefinition>) {
        let project = ProjectId::new();
        let defs = ["coder", "senior-coder", "tester", "writer"]
            .into_iter()
            .map(|name| AgentDefinition::new(project, name, "p", "m").with_description(format!("{name} agent")))
            .collect();
        (project, defs)
    }

    struct FixedReply {
        reply: String,
        calls: Mutex<u32>,
    }

    impl FixedReply {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelProvider for FixedReply {
        async fn invoke(
            &self,
            _model: &str,
            _system_prompt: &str,
            _history: &[ConversationMessage],
            _tools: &[ToolDescriptor],
        ) -> Result<ModelResponse, LLMError> {
            *self.calls.lock().await += 1;
            Ok(ModelResponse::text(self.reply.clone()))
        }
    }

    fn rules() -> RuleBasedSelector {
        RuleBasedSelector::new(vec![
            SelectionRule::new("TEST", "tester"),
            SelectionRule::new("docs", "ghost"),
            SelectionRule::new("docs", "writer"),
        ])
    }

    #[tokio::test]
    async fn test_hint_beats_rules() {
        let (project, catalog) = catalog();
        let task = SpecTask::new(project, "write tests", "", 0).with_hint("coder");
        let picked = rules().select(&task, &catalog).await.unwrap();
        assert_eq!(picked.name, "coder");
    }

    #[tokio::test]
    async fn test_rules_are_case_insensitive_and_skip_unknown_agents() {
        let (project, catalog) = catalog();
        let task = SpecTask::new(project, "Unit tests", "cover the parser", 0);
        assert_eq!(rules().select(&task, &catalog).await.unwrap().name, "tester");

        let task = SpecTask::new(project, "Update DOCS", "", 0);
        assert_eq!(rules().select(&task, &catalog).await.unwrap().name, "writer");

        let task = SpecTask::new(project, "deploy", "", 0);
        assert!(matches!(rules().select(&task, &catalog).await, Err(SelectionError::NoMatch(_))));
    }

    #[tokio::test]
    async fn test_wildcard_rule_catches_everything() {
        let (project, catalog) = catalog();
        let selector = RuleBasedSelector::new(vec![SelectionRule::new("*", "coder")]);
        let task = SpecTask::new(project, "anything", "", 0);
        assert_eq!(selector.select(&task, &catalog).await.unwrap().name, "coder");
    }

    #[tokio::test]
    async fn test_model_reply_names_an_agent() {
        let (project, catalog) = catalog();
        let task = SpecTask::new(project, "refactor", "", 0);

        let exact = ModelBasedSelector::new(FixedReply::new("`tester`"), "small");
        assert_eq!(exact.select(&task, &catalog).await.unwrap().name, "tester");

        let prose = ModelBasedSelector::new(FixedReply::new("I would pick senior-coder for this."), "small");
        assert_eq!(prose.select(&task, &catalog).await.unwrap().name, "senior-coder");

        let none = ModelBasedSelector::new(FixedReply::new("nobody fits"), "small");
        assert!(matches!(none.select(&task, &catalog).await, Err(SelectionError::NoMatch(_))));
    }

    #[tokio::test]
    async fn test_hybrid_only_calls_model_without_rule_match() {
        let (project, catalog) = catalog();
        let model = FixedReply::new("writer");
        let hybrid = HybridSelector::new(rules(), ModelBasedSelector::new(model.clone(), "small"));

        let matched = SpecTask::new(project, "integration test", "", 0);
        assert_eq!(hybrid.select(&matched, &catalog).await.unwrap().name, "tester");
        assert_eq!(*model.calls.lock().await, 0);

        let unmatched = SpecTask::new(project, "release notes", "", 0);
        assert_eq!(hybrid.select(&unmatched, &catalog).await.unwrap().name, "writer");
        assert_eq!(*model.calls.lock().await, 1);
    }

    #[tokio::test]
    async fn test_empty_catalog() {
        let task = SpecTask::new(ProjectId::new(), "t", "", 0);
        assert!(matches!(
            rules().select(&task, &[]).await,
            Err(SelectionError::EmptyCatalog)
        ));
    }
}
