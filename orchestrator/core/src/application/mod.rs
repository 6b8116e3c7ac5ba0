// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod coordination;
pub mod executor;
pub mod run_query;
pub mod tool_pool;
pub mod trigger;

// Re-export use cases for convenience
pub use coordination::{ListAvailableAgentsTool, SpawnAgentsTool, SpawnResult};
pub use executor::{AgentExecutor, ExecutionRequest, ExecutorError, ExecutorSettings};
pub use run_query::{RunDetails, RunQueryService, RunStats, RunTree};
pub use tool_pool::{ServerTool, ToolPool};
pub use trigger::{ScheduledDefinition, StandardTriggerService, TriggerService};
