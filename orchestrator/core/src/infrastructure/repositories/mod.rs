// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository ports defined in
//! `crate::domain::repository`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve runs, conversations and definitions
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **PostgresRunRepository** - runs, messages and tool calls in PostgreSQL
//! - **InMemoryRunRepository** - lock-guarded maps for tests and development
//! - **InMemoryDefinitionRegistry** - latest-version definition catalog
//!
//! Both run repositories enforce the same write rules: terminal runs and
//! finished tool calls are immutable.

pub mod postgres_run;

pub use postgres_run::PostgresRunRepository;

use crate::domain::agent::{AgentDefinition, AgentDefinitionId, ProjectId};
use crate::domain::repository::{
    message_cursor, run_cursor, tool_call_cursor, Cursor, DefinitionRegistry, Page, PageRequest,
    RepositoryError, RunFilter, RunRepository,
};
use crate::domain::run::{AgentRun, RunId, RunMessage, ToolCallId, ToolCallRecord, ToolCallStatus};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct RunStore {
    runs: HashMap<RunId, AgentRun>,
    messages: HashMap<RunId, Vec<RunMessage>>,
    tool_calls: HashMap<ToolCallId, ToolCallRecord>,
    tool_calls_by_run: HashMap<RunId, Vec<ToolCallId>>,
}

#[derive(Clone, Default)]
pub struct InMemoryRunRepository {
    store: Arc<RwLock<RunStore>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Page of `items`, already in append order, after the item the cursor
/// names. A cursor naming no item yields an empty page, as in Postgres.
fn page_in_append_order<T>(
    items: Vec<T>,
    page: &PageRequest,
    key: impl Fn(&T) -> Cursor,
) -> Result<Page<T>, RepositoryError> {
    let start = match page.decoded_cursor()? {
        None => 0,
        Some(cursor) => items
            .iter()
            .position(|item| key(item).id == cursor.id)
            .map_or(items.len(), |pos| pos + 1),
    };
    let items: Vec<T> = items
        .into_iter()
        .skip(start)
        .take(page.effective_limit() + 1)
        .collect();
    Ok(Page::from_overfetch(items, page.effective_limit(), key))
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, run: &AgentRun) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        if store.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} already exists", run.id)));
        }
        store.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &AgentRun) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        let stored = store
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("run {}", run.id)))?;
        if stored.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {} is {} and can no longer change",
                run.id, stored.status
            )));
        }
        *stored = run.clone();
        Ok(())
    }

    async fn find_run(&self, id: RunId) -> Result<Option<AgentRun>, RepositoryError> {
        Ok(self.store.read().runs.get(&id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter, page: &PageRequest) -> Result<Page<AgentRun>, RepositoryError> {
        let cursor = page.decoded_cursor()?;
        let limit = page.effective_limit();
        let mut runs: Vec<AgentRun> = self
            .store
            .read()
            .runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        runs.sort_by_key(|run| std::cmp::Reverse(run_cursor(run).key()));
        let runs: Vec<AgentRun> = runs
            .into_iter()
            .filter(|run| cursor.is_none_or(|c| run_cursor(run).key() < c.key()))
            .take(limit + 1)
            .collect();
        Ok(Page::from_overfetch(runs, limit, run_cursor))
    }

    async fn find_children(&self, parent: RunId) -> Result<Vec<AgentRun>, RepositoryError> {
        let mut children: Vec<AgentRun> = self
            .store
            .read()
            .runs
            .values()
            .filter(|run| run.parent_run_id == Some(parent))
            .cloned()
            .collect();
        children.sort_by_key(|run| run_cursor(run).key());
        Ok(children)
    }

    async fn append_message(&self, message: &RunMessage) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        if !store.runs.contains_key(&message.run_id) {
            return Err(RepositoryError::NotFound(format!("run {}", message.run_id)));
        }
        store.messages.entry(message.run_id).or_default().push(message.clone());
        Ok(())
    }

    async fn load_conversation(&self, run_id: RunId) -> Result<Vec<RunMessage>, RepositoryError> {
        Ok(self.store.read().messages.get(&run_id).cloned().unwrap_or_default())
    }

    async fn list_messages(&self, run_id: RunId, page: &PageRequest) -> Result<Page<RunMessage>, RepositoryError> {
        let messages = self.load_conversation(run_id).await?;
        page_in_append_order(messages, page, message_cursor)
    }

    async fn append_tool_call(&self, record: &ToolCallRecord) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        if !store.runs.contains_key(&record.run_id) {
            return Err(RepositoryError::NotFound(format!("run {}", record.run_id)));
        }
        if store.tool_calls.contains_key(&record.id) {
            return Err(RepositoryError::Conflict(format!("tool call {} already exists", record.id.0)));
        }
        store.tool_calls.insert(record.id, record.clone());
        store.tool_calls_by_run.entry(record.run_id).or_default().push(record.id);
        Ok(())
    }

    async fn update_tool_call(&self, record: &ToolCallRecord) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        let stored = store
            .tool_calls
            .get_mut(&record.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("tool call {}", record.id.0)))?;
        if stored.status != ToolCallStatus::Running {
            return Err(RepositoryError::Conflict(format!(
                "tool call {} is already {}",
                record.id.0, stored.status
            )));
        }
        *stored = record.clone();
        Ok(())
    }

    async fn find_tool_call(&self, id: ToolCallId) -> Result<Option<ToolCallRecord>, RepositoryError> {
        Ok(self.store.read().tool_calls.get(&id).cloned())
    }

    async fn list_tool_calls(&self, run_id: RunId, page: &PageRequest) -> Result<Page<ToolCallRecord>, RepositoryError> {
        let records: Vec<ToolCallRecord> = {
            let store = self.store.read();
            store
                .tool_calls_by_run
                .get(&run_id)
                .map(|ids| ids.iter().filter_map(|id| store.tool_calls.get(id).cloned()).collect())
                .unwrap_or_default()
        };
        page_in_append_order(records, page, tool_call_cursor)
    }
}

/// Definition catalog holding every version, serving the latest by name.
#[derive(Clone, Default)]
pub struct InMemoryDefinitionRegistry {
    definitions: Arc<RwLock<HashMap<AgentDefinitionId, AgentDefinition>>>,
    latest: Arc<RwLock<HashMap<(ProjectId, String), AgentDefinitionId>>>,
}

impl InMemoryDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definitions(definitions: impl IntoIterator<Item = AgentDefinition>) -> Result<Self, RepositoryError> {
        let registry = Self::new();
        for definition in definitions {
            registry.insert(definition)?;
        }
        Ok(registry)
    }

    fn insert(&self, definition: AgentDefinition) -> Result<(), RepositoryError> {
        let key = (definition.project_id, definition.name.clone());
        let mut latest = self.latest.write();
        let mut definitions = self.definitions.write();
        if let Some(current) = latest.get(&key).and_then(|id| definitions.get(id)) {
            if definition.version <= current.version {
                return Err(RepositoryError::Conflict(format!(
                    "definition '{}' version {} is not newer than {}",
                    definition.name, definition.version, current.version
                )));
            }
        }
        latest.insert(key, definition.id);
        definitions.insert(definition.id, definition);
        Ok(())
    }
}

#[async_trait]
impl DefinitionRegistry for InMemoryDefinitionRegistry {
    async fn list_definitions(&self, project: ProjectId) -> Result<Vec<AgentDefinition>, RepositoryError> {
        let latest = self.latest.read();
        let definitions = self.definitions.read();
        let mut listed: Vec<AgentDefinition> = latest
            .iter()
            .filter(|((p, _), _)| *p == project)
            .filter_map(|(_, id)| definitions.get(id).cloned())
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn get_definition(&self, project: ProjectId, name: &str) -> Result<Option<AgentDefinition>, RepositoryError> {
        let latest = self.latest.read();
        let definitions = self.definitions.read();
        Ok(latest
            .get(&(project, name.to_string()))
            .and_then(|id| definitions.get(id).cloned()))
    }

    async fn get_definition_by_id(&self, id: AgentDefinitionId) -> Result<Option<AgentDefinition>, RepositoryError> {
        Ok(self.definitions.read().get(&id).cloned())
    }

    async fn register(&self, definition: AgentDefinition) -> Result<(), RepositoryError> {
        self.insert(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::load_lineage_conversation;
    use crate::domain::run::{ConversationMessage, MessageId, RunStatus, ToolCallRequest};

    fn definition(name: &str) -> AgentDefinition {
        AgentDefinition::new(ProjectId::new(), name, "prompt", "model")
    }

    #[tokio::test]
    async fn test_terminal_runs_are_immutable() {
        let repo = InMemoryRunRepository::new();
        let mut run = AgentRun::new(&definition("a"), "in", None);
        repo.create_run(&run).await.unwrap();

        run.record_step().unwrap();
        repo.update_run(&run).await.unwrap();
        run.complete("done").unwrap();
        repo.update_run(&run).await.unwrap();

        let mut tampered = run.clone();
        tampered.summary = Some("rewritten".into());
        assert!(matches!(repo.update_run(&tampered).await, Err(RepositoryError::Conflict(_))));

        let stored = repo.find_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.summary.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_tool_call_can_only_finish_once() {
        let repo = InMemoryRunRepository::new();
        let run = AgentRun::new(&definition("a"), "in", None);
        repo.create_run(&run).await.unwrap();

        let request = ToolCallRequest {
            id: "c1".into(),
            name: "fs.read".into(),
            arguments: serde_json::json!({}),
        };
        let mut record = ToolCallRecord::start(run.id, MessageId::new(), 1, &request);
        repo.append_tool_call(&record).await.unwrap();
        record.complete(serde_json::json!("ok"), 3).unwrap();
        repo.update_tool_call(&record).await.unwrap();

        assert!(matches!(repo.update_tool_call(&record).await, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_message_pagination() {
        let repo = InMemoryRunRepository::new();
        let run = AgentRun::new(&definition("a"), "in", None);
        repo.create_run(&run).await.unwrap();
        for i in 0..5 {
            let message = RunMessage::new(run.id, i, ConversationMessage::user(format!("m{i}")));
            repo.append_message(&message).await.unwrap();
        }

        let first = repo.list_messages(run.id, &PageRequest::first(2)).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();

        let second = repo.list_messages(run.id, &PageRequest::after(cursor, 10)).await.unwrap();
        assert_eq!(second.items.len(), 3);
        assert!(second.next_cursor.is_none());

        let mut seen: Vec<_> = first.items.iter().chain(second.items.iter()).map(|m| m.id).collect();
        seen.sort_by_key(|id| id.0);
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_listings_follow_append_order() {
        let repo = InMemoryRunRepository::new();
        let run = AgentRun::new(&definition("a"), "in", None);
        repo.create_run(&run).await.unwrap();
        let at = chrono::Utc::now();
        // Same timestamp, ids sorting opposite to append order.
        for i in 0..4u32 {
            let mut message = RunMessage::new(run.id, i, ConversationMessage::user(format!("m{i}")));
            message.id = MessageId(uuid::Uuid::from_u128(100 - i as u128));
            message.created_at = at;
            repo.append_message(&message).await.unwrap();

            let request = ToolCallRequest {
                id: format!("c{i}"),
                name: "fs.read".into(),
                arguments: serde_json::json!({}),
            };
            let mut record = ToolCallRecord::start(run.id, message.id, i, &request);
            record.id = ToolCallId(uuid::Uuid::from_u128(100 - i as u128));
            record.created_at = at;
            repo.append_tool_call(&record).await.unwrap();
        }

        let replayed: Vec<_> = repo.load_conversation(run.id).await.unwrap().iter().map(|m| m.id).collect();
        let first = repo.list_messages(run.id, &PageRequest::first(3)).await.unwrap();
        let rest = repo
            .list_messages(run.id, &PageRequest::after(first.next_cursor.clone().unwrap(), 3))
            .await
            .unwrap();
        let listed: Vec<_> = first.items.iter().chain(rest.items.iter()).map(|m| m.id).collect();
        assert_eq!(listed, replayed);
        assert!(rest.next_cursor.is_none());

        let first = repo.list_tool_calls(run.id, &PageRequest::first(2)).await.unwrap();
        let rest = repo
            .list_tool_calls(run.id, &PageRequest::after(first.next_cursor.clone().unwrap(), 5))
            .await
            .unwrap();
        let call_ids: Vec<_> = first.items.iter().chain(rest.items.iter()).map(|r| r.call_id.as_str()).collect();
        assert_eq!(call_ids, vec!["c0", "c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_orders_newest_first() {
        let repo = InMemoryRunRepository::new();
        let def = definition("a");
        let mut older = AgentRun::new(&def, "1", None);
        older.created_at -= chrono::Duration::seconds(10);
        let newer = AgentRun::new(&def, "2", None);
        let other = AgentRun::new(&definition("b"), "3", None);
        for run in [&older, &newer, &other] {
            repo.create_run(run).await.unwrap();
        }

        let filter = RunFilter {
            agent_name: Some("a".into()),
            ..Default::default()
        };
        let page = repo.list_runs(&filter, &PageRequest::default()).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn test_lineage_conversation_spans_resumes() {
        let repo = InMemoryRunRepository::new();
        let def = definition("a");
        let mut first = AgentRun::new(&def, "start", Some(1));
        repo.create_run(&first).await.unwrap();
        repo.append_message(&RunMessage::new(first.id, 0, ConversationMessage::user("start")))
            .await
            .unwrap();
        first.pause("half done").unwrap();
        repo.update_run(&first).await.unwrap();

        let second = AgentRun::resume(&first, &def, "continue", Some(1), 500).unwrap();
        repo.create_run(&second).await.unwrap();
        repo.append_message(&RunMessage::new(second.id, 0, ConversationMessage::user("continue")))
            .await
            .unwrap();

        let lineage = load_lineage_conversation(&repo, second.id).await.unwrap();
        let texts: Vec<_> = lineage.iter().map(|m| m.content.text.clone().unwrap()).collect();
        assert_eq!(texts, vec!["start", "continue"]);
        assert_eq!(repo.load_conversation(second.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_registry_serves_latest_version() {
        let registry = InMemoryDefinitionRegistry::new();
        let v1 = definition("writer");
        let project = v1.project_id;
        let v2 = v1.supersede(|d| d.description = "newer".into());
        registry.register(v1.clone()).await.unwrap();
        registry.register(v2.clone()).await.unwrap();

        let latest = registry.get_definition(project, "writer").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(registry.list_definitions(project).await.unwrap().len(), 1);
        assert!(registry.get_definition_by_id(v1.id).await.unwrap().is_some());

        assert!(matches!(registry.register(v1).await, Err(RepositoryError::Conflict(_))));
    }
}
