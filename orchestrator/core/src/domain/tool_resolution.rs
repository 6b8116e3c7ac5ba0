// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Tool Resolution
//
// Narrows the tools available to a project down to what one definition may
// call at one delegation depth. Whitelist entries are exact names, `*`, or
// glob patterns (`fs.*`, `github.*_issue`).

use crate::domain::agent::AgentDefinition;
use crate::domain::tool::{is_coordination_tool, Tool};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct ToolResolver {
    max_depth: u32,
}

impl ToolResolver {
    pub fn new(max_depth: u32) -> Self {
        Self { max_depth }
    }

    /// Delegated runs lose the coordination tools unless the definition is
    /// depth-exempt and there is still room to delegate below them.
    pub fn coordination_allowed(&self, definition: &AgentDefinition, depth: u32) -> bool {
        depth == 0 || (definition.depth_exempt && depth < self.max_depth)
    }

    pub fn resolve(
        &self,
        definition: &AgentDefinition,
        depth: u32,
        available: &[Arc<dyn Tool>],
    ) -> Vec<Arc<dyn Tool>> {
        let coordination = self.coordination_allowed(definition, depth);
        let mut seen = HashSet::new();
        available
            .iter()
            .filter(|tool| coordination || !is_coordination_tool(tool.name()))
            .filter(|tool| whitelisted(&definition.tools, tool.name()))
            .filter(|tool| seen.insert(tool.name().to_string()))
            .cloned()
            .collect()
    }
}

pub fn whitelisted(patterns: &[String], tool_name: &str) -> bool {
    patterns.iter().any(|pattern| matches_pattern(pattern, tool_name))
}

fn matches_pattern(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(['*', '?', '[']) {
        return pattern == tool_name;
    }
    glob::Pattern::new(pattern)
        .map(|compiled| compiled.matches(tool_name))
        .unwrap_or(false)
}
