// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared test doubles: a model that plays back scripted turns per model name,
//! and a tool server that answers every call with an echo.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use switchyard_core::application::executor::{AgentExecutor, ExecutorSettings};
use switchyard_core::application::tool_pool::ToolPool;
use switchyard_core::domain::agent::{AgentDefinition, ProjectId};
use switchyard_core::domain::llm::{LLMError, ModelProvider, ModelResponse};
use switchyard_core::domain::repository::{DefinitionRegistry, PageRequest, RunRepository};
use switchyard_core::domain::run::{ConversationMessage, RunId, ToolCallRecord, ToolCallRequest};
use switchyard_core::domain::tool::{
    ToolDescriptor, ToolError, ToolServerClient, ToolServerConfig, ToolServerConnector,
};
use switchyard_core::infrastructure::event_bus::EventBus;
use switchyard_core::infrastructure::repositories::{InMemoryDefinitionRegistry, InMemoryRunRepository};
use tokio::sync::Mutex;

#[derive(Clone)]
pub enum Turn {
    Reply(ModelResponse),
    /// Never answers; only cancellation or a deadline ends the turn.
    Hang,
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub model: String,
    pub history: Vec<ConversationMessage>,
    pub tools: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<Turn>>>,
    fallback: Mutex<HashMap<String, Turn>>,
    invocations: Mutex<Vec<Invocation>>,
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

    /// Played whenever the script for `model` is exhausted.
    pub async fn repeat(&self, model: &str, turn: Turn) {
        self.fallback.lock().await.insert(model.to_string(), turn);
    }

    pub async fn invocations(&self, model: &str) -> Vec<Invocation> {
        self.invocations
            .lock()
            .await
            .iter()
            .filter(|i| i.model == model)
            .cloned()
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
        tools: &[ToolDescriptor],
    ) -> Result<ModelResponse, LLMError> {
        self.invocations.lock().await.push(Invocation {
            model: model.to_string(),
            history: history.to_vec(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
        });

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

struct EchoClient;

#[async_trait]
impl ToolServerClient for EchoClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        Ok(["fs.read", "fs.write", "web.fetch"]
            .into_iter()
            .map(|name| ToolDescriptor {
                name: name.to_string(),
                description: format!("{name} test tool"),
                input_schema: json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        if arguments.get("fail").is_some() {
            return Err(ToolError::Execution(format!("{name} failed")));
        }
        Ok(json!(format!("{name} ok: {arguments}")))
    }
}

struct EchoConnector;

#[async_trait]
impl ToolServerConnector for EchoConnector {
    async fn connect(&self, _config: &ToolServerConfig) -> Result<Arc<dyn ToolServerClient>, ToolError> {
        Ok(Arc::new(EchoClient))
    }
}

pub struct Harness {
    pub project: ProjectId,
    pub executor: Arc<AgentExecutor>,
    pub runs: Arc<InMemoryRunRepository>,
    pub registry: Arc<InMemoryDefinitionRegistry>,
    pub model: Arc<ScriptedModel>,
    pub events: EventBus,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(ExecutorSettings::default())
    }

    pub fn with_settings(settings: ExecutorSettings) -> Self {
        let project = ProjectId::new();
        let runs = Arc::new(InMemoryRunRepository::new());
        let registry = Arc::new(InMemoryDefinitionRegistry::new());
        let model = Arc::new(ScriptedModel::default());
        let events = EventBus::new(1024);
        let tools = Arc::new(ToolPool::new(
            Arc::new(EchoConnector),
            HashMap::from([(
                project,
                vec![ToolServerConfig {
                    name: "echo".into(),
                    command: "echo-server".into(),
                    args: vec![],
                    env: HashMap::new(),
                }],
            )]),
        ));
        let executor = AgentExecutor::new(
            model.clone(),
            runs.clone(),
            registry.clone(),
            tools,
            events.clone(),
            settings,
        );
        Self {
            project,
            executor,
            runs,
            registry,
            model,
            events,
        }
    }

    /// A definition using a model of the same name, allowed every tool.
    pub fn agent(&self, name: &str) -> AgentDefinition {
        AgentDefinition::new(self.project, name, format!("You are {name}."), name)
            .with_description(format!("{name} agent"))
            .with_tools(["*"])
    }

    pub async fn install(&self, definition: AgentDefinition) -> AgentDefinition {
        self.registry.register(definition.clone()).await.unwrap();
        definition
    }

    pub async fn tool_calls(&self, run_id: RunId) -> Vec<ToolCallRecord> {
        self.runs
            .list_tool_calls(run_id, &PageRequest::first(200))
            .await
            .unwrap()
            .items
    }
}
