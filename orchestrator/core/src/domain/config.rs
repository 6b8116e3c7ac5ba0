// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Coordinator Configuration
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) holding every
// tunable of the coordinator:
// - Delegation depth, step ceilings and concurrency limits
// - Run timeouts and the wrap-up grace period
// - Doom-loop threshold
// - Task dispatcher and consensus settings
// - Per-project tool servers, model provider and state store

use crate::domain::agent::ProjectId;
use crate::domain::tool::ToolServerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const API_VERSION: &str = "switchyard.dev/v1";
pub const KIND: &str = "CoordinatorConfig";
pub const DATABASE_URL_ENV: &str = "SWITCHYARD_DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Environment variable not set: {0}")]
    MissingEnv(String),
}

/// Top-level Kubernetes-style coordinator manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfigManifest {
    /// API version (must be "switchyard.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "CoordinatorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: CoordinatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub doom_loop: DoomLoopConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Tool servers available to each project
    #[serde(default)]
    pub tool_servers: Vec<ProjectToolServers>,

    #[serde(default)]
    pub model_provider: Option<ModelProviderConfig>,

    #[serde(default)]
    pub state_store: StateStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Deepest delegation level a run may reach (root is depth 0)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Steps a run lineage may take across all resumes
    #[serde(default = "default_max_total_steps")]
    pub max_total_steps_per_run: u32,

    /// Step budget for delegated runs whose definition sets none
    #[serde(default = "default_delegated_max_steps")]
    pub delegated_max_steps: u32,

    /// Agent runs executing at once across the process
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Continuation turns a loop flow may take
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_run_timeout", with = "humantime_serde")]
    pub default: Duration,

    /// Time allowed for the wrap-up reply after a deadline
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoomLoopConfig {
    #[serde(default = "default_doom_loop_threshold")]
    pub threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Case-insensitive markers that count as approval in a reviewer reply
    #[serde(default = "default_approval_markers")]
    pub approval_markers: Vec<String>,

    /// Reviewer used when a collaborative task names none
    #[serde(default)]
    pub default_reviewer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectToolServers {
    pub project_id: ProjectId,

    #[serde(default)]
    pub servers: Vec<ToolServerConfig>,
}

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProviderConfig {
    pub endpoint: String,

    /// Supports "env:VAR_NAME" syntax
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateStoreConfig {
    #[default]
    InMemory,
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_depth() -> u32 {
    2
}

fn default_max_total_steps() -> u32 {
    500
}

fn default_delegated_max_steps() -> u32 {
    50
}

fn default_max_concurrent_runs() -> usize {
    16
}

fn default_max_loop_iterations() -> u32 {
    5
}

fn default_run_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_doom_loop_threshold() -> u32 {
    3
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_rounds() -> u32 {
    3
}

fn default_approval_markers() -> Vec<String> {
    vec!["APPROVED".to_string()]
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_connections() -> u32 {
    5
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_total_steps_per_run: default_max_total_steps(),
            delegated_max_steps: default_delegated_max_steps(),
            max_concurrent_runs: default_max_concurrent_runs(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: default_run_timeout(),
            grace_period: default_grace_period(),
        }
    }
}

impl Default for DoomLoopConfig {
    fn default() -> Self {
        Self {
            threshold: default_doom_loop_threshold(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_max_retries: default_max_retries(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            approval_markers: default_approval_markers(),
            default_reviewer: None,
        }
    }
}

impl Default for CoordinatorConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "switchyard".to_string(),
                labels: None,
            },
            spec: CoordinatorConfig::default(),
        }
    }
}

impl CoordinatorConfigManifest {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let manifest: Self = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load from `path` when given, defaults otherwise; environment overrides
    /// are applied either way.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut manifest = match path {
            Some(path) => {
                tracing::info!("Loading coordinator configuration from {:?}", path);
                Self::from_yaml_file(path)?
            }
            None => {
                tracing::warn!("No configuration file given. Using defaults.");
                Self::default()
            }
        };
        manifest.apply_env_overrides();
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            tracing::info!("Environment override: {} set, using postgres state store", DATABASE_URL_ENV);
            let max_connections = match &self.spec.state_store {
                StateStoreConfig::Postgres { max_connections, .. } => *max_connections,
                StateStoreConfig::InMemory => default_max_connections(),
            };
            self.spec.state_store = StateStoreConfig::Postgres { url, max_connections };
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::Invalid(format!(
                "apiVersion '{}' must be '{}'",
                self.api_version, API_VERSION
            )));
        }
        if self.kind != KIND {
            return Err(ConfigError::Invalid(format!("kind '{}' must be '{}'", self.kind, KIND)));
        }
        if self.metadata.name.is_empty() {
            return Err(ConfigError::Invalid("metadata.name cannot be empty".into()));
        }
        self.spec.validate()
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // spawn_agents needs at least one level below the root.
        if self.limits.max_depth == 0 {
            return Err(ConfigError::Invalid("limits.max_depth must be at least 1".into()));
        }
        if self.limits.max_total_steps_per_run < 2 {
            return Err(ConfigError::Invalid(
                "limits.max_total_steps_per_run must be at least 2".into(),
            ));
        }
        if self.limits.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid("limits.max_concurrent_runs must be positive".into()));
        }
        if self.dispatcher.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.max_concurrent_tasks must be positive".into(),
            ));
        }
        if self.timeouts.grace_period > self.timeouts.default {
            return Err(ConfigError::Invalid(format!(
                "timeouts.grace_period ({:?}) cannot exceed timeouts.default ({:?})",
                self.timeouts.grace_period, self.timeouts.default
            )));
        }
        if self.doom_loop.threshold < 2 {
            return Err(ConfigError::Invalid("doom_loop.threshold must be at least 2".into()));
        }
        if self.consensus.max_rounds == 0 {
            return Err(ConfigError::Invalid("consensus.max_rounds must be positive".into()));
        }
        if self.consensus.approval_markers.iter().all(|m| m.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "consensus.approval_markers needs at least one non-empty marker".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for project in &self.tool_servers {
            for server in &project.servers {
                if server.name.is_empty() || server.command.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "tool server for project {} needs a name and a command",
                        project.project_id
                    )));
                }
                if !seen.insert((project.project_id, server.name.as_str())) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate tool server '{}' for project {}",
                        server.name, project.project_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn tool_servers_for(&self, project: ProjectId) -> Vec<ToolServerConfig> {
        self.tool_servers
            .iter()
            .filter(|p| p.project_id == project)
            .flat_map(|p| p.servers.iter().cloned())
            .collect()
    }
}

/// Resolve a config value that may use "env:VAR_NAME" syntax
pub fn resolve_env_value(value: &str) -> Result<String, ConfigError> {
    match value.strip_prefix("env:") {
        Some(var_name) => {
            std::env::var(var_name).map_err(|_| ConfigError::MissingEnv(var_name.to_string()))
        }
        None => Ok(value.to_string()),
    }
}
