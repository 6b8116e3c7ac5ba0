// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Definitions
//!
//! An [`AgentDefinition`] is the immutable, versioned configuration of one kind
//! of agent inside a project: prompt, model reference, tool whitelist, trigger,
//! flow type and governor overrides. Definitions are never edited in place;
//! [`AgentDefinition::supersede`] produces the next version with a fresh id.
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `tools` | Glob whitelist; `*` grants every tool |
//! | `flow_type` | `single`, `sequential` or `loop` |
//! | `max_steps` | Per-run step budget override |
//! | `default_timeout` | Per-run wall-clock override |
//! | `visibility` | Who may discover and invoke the definition |
//! | `depth_exempt` | Keeps coordination tools below depth 0 |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentDefinitionId(pub Uuid);

impl AgentDefinitionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentDefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentDefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who may discover and invoke a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Reachable from outside the project (requires an [`ExternalExposure`]).
    External,
    /// Discoverable by other agents in the same project.
    #[default]
    Project,
    /// Only reachable as a named sub-agent of a sequential flow.
    Internal,
}

/// What starts a run of this definition besides a direct invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    None,
    Event {
        name: String,
    },
    /// Cron expression; evaluated by an external scheduler.
    Schedule {
        expression: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    #[default]
    Single,
    Sequential,
    Loop,
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowType::Single => write!(f, "single"),
            FlowType::Sequential => write!(f, "sequential"),
            FlowType::Loop => write!(f, "loop"),
        }
    }
}

/// Metadata describing how an externally visible definition is addressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalExposure {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: AgentDefinitionId,
    pub project_id: ProjectId,
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    pub model: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub flow_type: FlowType,
    /// Ordered sub-agent names executed before this agent in a sequential flow.
    #[serde(default)]
    pub sub_agents: Vec<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub default_timeout: Option<Duration>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub exposure: Option<ExternalExposure>,
    #[serde(default)]
    pub depth_exempt: bool,
    pub created_at: DateTime<Utc>,
}

impl AgentDefinition {
    pub fn new(
        project_id: ProjectId,
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: AgentDefinitionId::new(),
            project_id,
            name: name.into(),
            version: 1,
            description: String::new(),
            system_prompt: system_prompt.into(),
            model: model.into(),
            tools: Vec::new(),
            trigger: Trigger::None,
            flow_type: FlowType::Single,
            sub_agents: Vec::new(),
            max_steps: None,
            default_timeout: None,
            visibility: Visibility::Project,
            exposure: None,
            depth_exempt: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flow(mut self, flow_type: FlowType, sub_agents: Vec<String>) -> Self {
        self.flow_type = flow_type;
        self.sub_agents = sub_agents;
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_exposure(mut self, exposure: ExternalExposure) -> Self {
        self.visibility = Visibility::External;
        self.exposure = Some(exposure);
        self
    }

    pub fn depth_exempt(mut self) -> Self {
        self.depth_exempt = true;
        self
    }

    /// Produce the next version of this definition. The previous version is
    /// left untouched so runs that reference it keep a stable snapshot.
    pub fn supersede(&self, edit: impl FnOnce(&mut AgentDefinition)) -> AgentDefinition {
        let mut next = self.clone();
        edit(&mut next);
        next.id = AgentDefinitionId::new();
        next.project_id = self.project_id;
        next.name = self.name.clone();
        next.version = self.version + 1;
        next.created_at = Utc::now();
        next
    }

    /// Step budget for a run at `depth`. Top-level runs without an override are
    /// bounded only by the global ceiling.
    pub fn step_budget(&self, depth: u32, delegated_default: u32) -> Option<u32> {
        match (self.max_steps, depth) {
            (Some(max), _) => Some(max),
            (None, 0) => None,
            (None, _) => Some(delegated_default),
        }
    }

    pub fn responds_to_event(&self, event_name: &str) -> bool {
        matches!(&self.trigger, Trigger::Event { name } if name == event_name)
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            flow_type: self.flow_type,
            tools: self.tools.clone(),
        }
    }
}

/// Catalog entry returned by `list_available_agents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
    pub flow_type: FlowType,
    pub tools: Vec<String>,
}
