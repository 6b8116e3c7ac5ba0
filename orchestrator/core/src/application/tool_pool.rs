// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Project Tool Pool
//
// Connects each project's tool servers lazily on first use and caches the
// resulting tool set. A server that fails to connect or list its tools is
// logged and skipped; the rest of the project's tools stay usable.

use crate::domain::agent::ProjectId;
use crate::domain::tool::{
    Tool, ToolContext, ToolDescriptor, ToolError, ToolServerClient, ToolServerConfig, ToolServerConnector,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// A tool served by a connected tool server.
pub struct ServerTool {
    descriptor: ToolDescriptor,
    server: String,
    client: Arc<dyn ToolServerClient>,
}

impl ServerTool {
    pub fn server(&self) -> &str {
        &self.server
    }
}

#[async_trait]
impl Tool for ServerTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, _ctx: &ToolContext, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        self.client.call_tool(&self.descriptor.name, input).await
    }
}

type ProjectTools = Arc<OnceCell<Vec<Arc<dyn Tool>>>>;

pub struct ToolPool {
    connector: Arc<dyn ToolServerConnector>,
    servers: HashMap<ProjectId, Vec<ToolServerConfig>>,
    cache: DashMap<ProjectId, ProjectTools>,
}

impl ToolPool {
    pub fn new(connector: Arc<dyn ToolServerConnector>, servers: HashMap<ProjectId, Vec<ToolServerConfig>>) -> Self {
        Self {
            connector,
            servers,
            cache: DashMap::new(),
        }
    }

    /// Pool with no tool servers at all.
    pub fn empty(connector: Arc<dyn ToolServerConnector>) -> Self {
        Self::new(connector, HashMap::new())
    }

    /// Every server-provided tool of `project`, connecting on first call.
    pub async fn project_tools(&self, project: ProjectId) -> Vec<Arc<dyn Tool>> {
        let cell = self
            .cache
            .entry(project)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_init(|| self.connect_project(project)).await.clone()
    }

    /// Drop cached connections for a project; the next run reconnects.
    pub fn invalidate(&self, project: ProjectId) {
        if self.cache.remove(&project).is_some() {
            info!("Invalidated tool servers for project {}", project);
        }
    }

    async fn connect_project(&self, project: ProjectId) -> Vec<Arc<dyn Tool>> {
        let Some(configs) = self.servers.get(&project) else {
            return Vec::new();
        };

        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        for config in configs {
            let client = match self.connector.connect(config).await {
                Ok(client) => client,
                Err(e) => {
                    warn!("Skipping tool server '{}' for project {}: {}", config.name, project, e);
                    continue;
                }
            };
            let descriptors = match client.list_tools().await {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    warn!("Skipping tool server '{}' for project {}: {}", config.name, project, e);
                    continue;
                }
            };
            info!(
                "Tool server '{}' connected for project {} ({} tools)",
                config.name,
                project,
                descriptors.len()
            );
            tools.extend(descriptors.into_iter().map(|descriptor| {
                Arc::new(ServerTool {
                    descriptor,
                    server: config.name.clone(),
                    client: Arc::clone(&client),
                }) as Arc<dyn Tool>
            }));
        }
        tools
    }
}
