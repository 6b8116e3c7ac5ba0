// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Test doubles for dispatcher tests: a model that plays back scripted turns
//! per model name, and a fully wired dispatcher over in-memory stores.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::application::executor::{AgentExecutor, ExecutorSettings};
use switchyard_core::application::tool_pool::ToolPool;
use switchyard_core::domain::agent::{AgentDefinition, ProjectId};
use switchyard_core::domain::llm::{LLMError, ModelProvider, ModelResponse};
use switchyard_core::domain::repository::DefinitionRegistry;
use switchyard_core::domain::run::{ConversationMessage, ToolCallRequest};
use switchyard_core::domain::tool::{ToolDescriptor, ToolError, ToolServerClient, ToolServerConfig, ToolServerConnector};
use switchyard_core::infrastructure::event_bus::EventBus;
use switchyard_core::infrastructure::repositories::{InMemoryDefinitionRegistry, InMemoryRunRepository};
use switchyard_swarm::application::{
    AgentSelector, ConsensusSettings, DiscussionCoordinator, DispatcherSettings, RuleBasedSelector, SelectionRule,
    TaskDispatcher,
};
use switchyard_swarm::domain::{SpecTask, TaskRepository};
use switchyard_swarm::infrastructure::{InMemoryDiscussionRepository, InMemoryTaskRepository};
use tokio::sync::Mutex;

#[derive(Clone)]
pub enum Turn {
    Reply(ModelResponse),
    Hang,
    Fail(String),
}

#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<Turn>>>,
    fallback: Mutex<HashMap<String, Turn>>,
    invocations: Mutex<Vec<(String, Vec<ConversationMessage>)>>,
}

impl ScriptedModel {
    pub async fn script(&self, model: &str, turns: Vec<Turn>) {
        self.scripts
            .lock()
            .await
            .entry(model.to_string())
            .or_default()
            .extend(turns);
    }

    pub async fn repeat(&self, model: &str, turn: Turn) {
        self.fallback.lock().await.insert(model.to_string(), turn);
    }

    /// Histories passed to `model`, oldest first.
    pub async fn histories(&self, model: &str) -> Vec<Vec<ConversationMessage>> {
        self.invocations
            .lock()
            .await
            .iter()
            .filter(|(m, _)| m == model)
            .map(|(_, history)| history.clone())
            .collect()
    }

    /// The opening user message of every invocation of `model`.
    pub async fn inputs(&self, model: &str) -> Vec<String> {
        self.histories(model)
            .await
            .iter()
            .map(|history| history.first().map(|m| m.text_content().to_string()).unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    async fn invoke(
        &self,
        model: &str,
        _system_prompt: &str,
        history: &[ConversationMessage],
        _tools: &[ToolDescriptor],
    ) -> Result<ModelResponse, LLMError> {
        self.invocations
            .lock()
            .await
            .push((model.to_string(), history.to_vec()));

        let scripted = self.scripts.lock().await.get_mut(model).and_then(VecDeque::pop_front);
        let turn = match scripted {
            Some(turn) => Some(turn),
            None => self.fallback.lock().await.get(model).cloned(),
        };
        match turn {
            Some(Turn::Reply(response)) => Ok(response),
            Some(Turn::Fail(message)) => Err(LLMError::Provider(message)),
            Some(Turn::Hang) => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            None => Err(LLMError::Provider(format!("no script left for {model}"))),
        }
    }
}

pub fn say(text: &str) -> Turn {
    Turn::Reply(ModelResponse::text(text))
}

pub fn call(tool: &str, arguments: Value) -> Turn {
    Turn::Reply(ModelResponse::tool_calls(vec![ToolCallRequest {
        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
        name: tool.to_string(),
        arguments,
    }]))
}

struct NoServers;

#[async_trait]
impl ToolServerConnector for NoServers {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn ToolServerClient>, ToolError> {
        Err(ToolError::Execution(format!("no tool server '{}' in tests", config.name)))
    }
}

pub struct Harness {
    pub project: ProjectId,
    pub executor: Arc<AgentExecutor>,
    pub registry: Arc<InMemoryDefinitionRegistry>,
    pub tasks: Arc<InMemoryTaskRepository>,
    pub discussions: Arc<InMemoryDiscussionRepository>,
    pub model: Arc<ScriptedModel>,
    pub events: EventBus,
}

impl Harness {
    pub fn new() -> Self {
        let project = ProjectId::new();
        let registry = Arc::new(InMemoryDefinitionRegistry::new());
        let model = Arc::new(ScriptedModel::default());
        let events = EventBus::new(1024);
        let executor = AgentExecutor::new(
            model.clone(),
            Arc::new(InMemoryRunRepository::new()),
            registry.clone(),
            Arc::new(ToolPool::empty(Arc::new(NoServers))),
            events.clone(),
            ExecutorSettings::default(),
        );
        Self {
            project,
            executor,
            registry,
            tasks: Arc::new(InMemoryTaskRepository::new()),
            discussions: Arc::new(InMemoryDiscussionRepository::new()),
            model,
            events,
        }
    }

    /// Register an agent whose model shares its name.
    pub async fn agent(&self, name: &str) -> AgentDefinition {
        self.install(
            AgentDefinition::new(self.project, name, format!("You are {name}."), name)
                .with_description(format!("{name} agent")),
        )
        .await
    }

    pub async fn install(&self, definition: AgentDefinition) -> AgentDefinition {
        self.registry.register(definition.clone()).await.unwrap();
        definition
    }

    pub fn settings() -> DispatcherSettings {
        DispatcherSettings {
            poll_interval: Duration::from_millis(10),
            ..DispatcherSettings::default()
        }
    }

    /// Dispatcher that sends every task without a hint to `coder`.
    pub fn dispatcher(&self) -> Arc<TaskDispatcher> {
        self.dispatcher_with(Arc::new(RuleBasedSelector::new(vec![SelectionRule::new("*", "coder")])))
    }

    pub fn dispatcher_with(&self, selector: Arc<dyn AgentSelector>) -> Arc<TaskDispatcher> {
        Arc::new(TaskDispatcher::new(
            self.executor.clone(),
            self.tasks.clone(),
            selector,
            Self::settings(),
        ))
    }

    pub fn coordinator(&self, settings: ConsensusSettings) -> Arc<DiscussionCoordinator> {
        Arc::new(DiscussionCoordinator::new(
            self.executor.clone(),
            self.discussions.clone(),
            settings,
        ))
    }

    pub fn collaborative_dispatcher(&self, settings: ConsensusSettings) -> Arc<TaskDispatcher> {
        Arc::new(
            TaskDispatcher::new(
                self.executor.clone(),
                self.tasks.clone(),
                Arc::new(RuleBasedSelector::new(vec![SelectionRule::new("*", "coder")])),
                Self::settings(),
            )
            .with_consensus(self.coordinator(settings)),
        )
    }

    pub async fn task(&self, title: &str) -> SpecTask {
        self.tasks
            .list(self.project)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.title == title)
            .unwrap()
    }
}
