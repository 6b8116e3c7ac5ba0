// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Run Inspection
//
// Read-only queries over the run store for audit and debugging: paged run,
// message and tool-call listings, per-run statistics and the delegation tree.

use crate::domain::repository::{Page, PageRequest, RepositoryError, RunFilter, RunRepository};
use crate::domain::run::{AgentRun, MessageRole, RunId, RunMessage, ToolCallId, ToolCallRecord, ToolCallStatus};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub message_count: usize,
    pub tool_call_count: usize,
    pub tool_error_count: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDetails {
    pub run: AgentRun,
    pub stats: RunStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunTree {
    pub run: AgentRun,
    pub children: Vec<RunTree>,
}

impl RunTree {
    /// Number of runs in the tree, including the root.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(RunTree::size).sum::<usize>()
    }
}

pub struct RunQueryService {
    runs: Arc<dyn RunRepository>,
}

impl RunQueryService {
    pub fn new(runs: Arc<dyn RunRepository>) -> Self {
        Self { runs }
    }

    pub async fn list_runs(&self, filter: &RunFilter, page: &PageRequest) -> Result<Page<AgentRun>, RepositoryError> {
        self.runs.list_runs(filter, page).await
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<RunDetails, RepositoryError> {
        let run = self.find(run_id).await?;
        let messages = self.runs.load_conversation(run_id).await?;
        let tool_calls = self.all_tool_calls(run_id).await?;
        Ok(RunDetails {
            run,
            stats: stats(&messages, &tool_calls),
        })
    }

    pub async fn list_messages(&self, run_id: RunId, page: &PageRequest) -> Result<Page<RunMessage>, RepositoryError> {
        self.find(run_id).await?;
        self.runs.list_messages(run_id, page).await
    }

    pub async fn list_tool_calls(
        &self,
        run_id: RunId,
        page: &PageRequest,
    ) -> Result<Page<ToolCallRecord>, RepositoryError> {
        self.find(run_id).await?;
        self.runs.list_tool_calls(run_id, page).await
    }

    pub async fn get_tool_call(&self, id: ToolCallId) -> Result<ToolCallRecord, RepositoryError> {
        self.runs
            .find_tool_call(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("tool call {}", id.0)))
    }

    /// The run and every run it delegated to, recursively.
    pub fn run_tree(&self, run_id: RunId) -> BoxFuture<'_, Result<RunTree, RepositoryError>> {
        Box::pin(async move {
            let run = self.find(run_id).await?;
            let mut children = Vec::new();
            for child in self.runs.find_children(run_id).await? {
                children.push(self.run_tree(child.id).await?);
            }
            Ok(RunTree { run, children })
        })
    }

    async fn find(&self, run_id: RunId) -> Result<AgentRun, RepositoryError> {
        self.runs
            .find_run(run_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("run {run_id}")))
    }

    async fn all_tool_calls(&self, run_id: RunId) -> Result<Vec<ToolCallRecord>, RepositoryError> {
        let mut records = Vec::new();
        let mut page = PageRequest::first(crate::domain::repository::MAX_PAGE_SIZE);
        loop {
            let batch = self.runs.list_tool_calls(run_id, &page).await?;
            records.extend(batch.items);
            match batch.next_cursor {
                Some(cursor) => page = PageRequest::after(cursor, crate::domain::repository::MAX_PAGE_SIZE),
                None => return Ok(records),
            }
        }
    }
}

fn stats(messages: &[RunMessage], tool_calls: &[ToolCallRecord]) -> RunStats {
    let mut stats = RunStats {
        message_count: messages.len(),
        tool_call_count: tool_calls.len(),
        tool_error_count: tool_calls.iter().filter(|t| t.status == ToolCallStatus::Error).count(),
        ..RunStats::default()
    };
    for usage in messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .filter_map(|m| m.usage)
    {
        stats.prompt_tokens += u64::from(usage.prompt_tokens);
        stats.completion_tokens += u64::from(usage.completion_tokens);
    }
    stats
}
