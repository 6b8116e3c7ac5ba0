// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Task Dispatcher
//
// Walks a project's task graph by polling: every poll picks the pending,
// unassigned tasks whose predecessors have all completed, selects an agent
// for each (up to the concurrency cap), claims the task atomically and runs
// it through the executor as an independent worker. Workers write the
// outcome back to the task:
//
// - completed run  -> task completed
// - cancelled run  -> task back to pending, retry budget untouched
// - anything else  -> failure context recorded, requeued while retries
//                     remain, otherwise failed and every dependent skipped
//
// Tasks created while the dispatcher runs are picked up on the next poll.

use crate::application::consensus::DiscussionCoordinator;
use crate::application::selector::{AgentSelector, SelectionError};
use crate::domain::graph::{dependents_of, TaskGraphError, TaskGraphSpec, TaskSpec};
use crate::domain::repository::{RepositoryError, TaskRepository};
use crate::domain::task::{FailureOutcome, SpecTask, TaskError, TaskId, TaskStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_core::application::executor::{AgentExecutor, ExecutionRequest};
use switchyard_core::domain::agent::{AgentDefinition, ProjectId};
use switchyard_core::domain::config::CoordinatorConfig;
use switchyard_core::domain::events::TaskEvent;
use switchyard_core::domain::run::{AgentRun, RunStatus};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub poll_interval: Duration,
    pub max_concurrent_tasks: usize,
    pub default_max_retries: u32,
}

impl DispatcherSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            poll_interval: config.dispatcher.poll_interval,
            max_concurrent_tasks: config.dispatcher.max_concurrent_tasks,
            default_max_retries: config.dispatcher.default_max_retries,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Graph(#[from] TaskGraphError),

    #[error("Unknown predecessor task: {0}")]
    UnknownPredecessor(TaskId),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Work handed to [`TaskDispatcher::dispatch`].
#[derive(Debug, Clone)]
pub enum DispatchRequest {
    /// Free text; becomes a single task.
    Description(String),
    Graph(TaskGraphSpec),
}

/// A task added to an existing graph, typically by a running agent.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub agent_hint: Option<String>,
    pub blocked_by: Vec<TaskId>,
    pub max_retries: Option<u32>,
    pub requires_collaboration: bool,
    pub reviewer: Option<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn blocked_by(mut self, predecessors: impl IntoIterator<Item = TaskId>) -> Self {
        self.blocked_by.extend(predecessors);
        self
    }
}

/// Task counts per status for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl DispatchSummary {
    fn tally(tasks: &[SpecTask]) -> Self {
        let mut summary = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

struct Assignment {
    agent: String,
    cancel: CancellationToken,
}

/// How one attempt ended, before it is written back to the task.
enum Attempt {
    Completed(AgentRun),
    Cancelled(Option<AgentRun>),
    Failed { reason: String, run: Option<AgentRun> },
}

impl Attempt {
    fn failed(reason: impl Into<String>) -> Self {
        Attempt::Failed {
            reason: reason.into(),
            run: None,
        }
    }
}

pub struct TaskDispatcher {
    executor: Arc<AgentExecutor>,
    tasks: Arc<dyn TaskRepository>,
    selector: Arc<dyn AgentSelector>,
    consensus: Option<Arc<DiscussionCoordinator>>,
    settings: DispatcherSettings,
    active: Mutex<HashMap<TaskId, Assignment>>,
}

impl TaskDispatcher {
    pub fn new(
        executor: Arc<AgentExecutor>,
        tasks: Arc<dyn TaskRepository>,
        selector: Arc<dyn AgentSelector>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            executor,
            tasks,
            selector,
            consensus: None,
            settings,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Enable collaborative tasks.
    pub fn with_consensus(mut self, coordinator: Arc<DiscussionCoordinator>) -> Self {
        self.consensus = Some(coordinator);
        self
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Validate and persist new work. Nothing is stored when validation fails.
    pub async fn dispatch(&self, project: ProjectId, request: DispatchRequest) -> Result<Vec<SpecTask>, DispatchError> {
        let graph = match request {
            DispatchRequest::Description(text) => TaskGraphSpec::new(vec![TaskSpec::new(title_from(&text), text)]),
            DispatchRequest::Graph(graph) => graph,
        };
        let tasks = graph.build(project, self.settings.default_max_retries)?;
        self.tasks.insert_all(&tasks).await?;
        info!(project_id = %project, tasks = tasks.len(), "Task graph dispatched");
        Ok(tasks)
    }

    /// Add one task to a project's graph. A task blocked by a predecessor
    /// that already failed for good is stored as skipped.
    pub async fn create_task(&self, project: ProjectId, new: NewTask) -> Result<SpecTask, DispatchError> {
        let existing = self.tasks.list(project).await?;
        let mut dead_predecessor = None;
        for id in &new.blocked_by {
            let predecessor = existing
                .iter()
                .find(|t| t.id == *id)
                .ok_or(DispatchError::UnknownPredecessor(*id))?;
            if predecessor.status.blocks_dependents() {
                dead_predecessor = Some(predecessor.id);
            }
        }

        let mut task = SpecTask::new(
            project,
            new.title,
            new.description,
            new.max_retries.unwrap_or(self.settings.default_max_retries),
        )
        .blocked_by(new.blocked_by);
        task.agent_hint = new.agent_hint;
        if new.requires_collaboration {
            task = task.collaborative(new.reviewer);
        }
        if dead_predecessor.is_some() {
            task.skip()?;
        }

        self.tasks.insert_all(std::slice::from_ref(&task)).await?;
        if let Some(blocked_by) = dead_predecessor {
            self.publish_skipped(task.id, blocked_by);
        }
        info!(task_id = %task.id, title = %task.title, status = %task.status, "Task created");
        Ok(task)
    }

    pub async fn summary(&self, project: ProjectId) -> Result<DispatchSummary, DispatchError> {
        Ok(DispatchSummary::tally(&self.tasks.list(project).await?))
    }

    /// Tasks currently being worked on, with their assigned agent.
    pub fn active_tasks(&self) -> Vec<(TaskId, String)> {
        self.active
            .lock()
            .iter()
            .map(|(id, assignment)| (*id, assignment.agent.clone()))
            .collect()
    }

    /// Cancel the run working on `task_id`. The task returns to pending.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        match self.active.lock().get(&task_id) {
            Some(assignment) => {
                info!(%task_id, "Cancelling task");
                assignment.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Poll until nothing is running and nothing more can be started.
    pub async fn run_until_idle(self: &Arc<Self>, project: ProjectId) -> Result<DispatchSummary, DispatchError> {
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        loop {
            let launched = match self.poll(project, &mut workers, &cancel).await {
                Ok(launched) => launched,
                Err(err) => {
                    cancel.cancel();
                    drain(&mut workers).await;
                    return Err(err);
                }
            };
            if launched == 0 && workers.is_empty() {
                break;
            }
            tokio::select! {
                joined = workers.join_next(), if !workers.is_empty() => log_join(joined),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        self.summary(project).await
    }

    /// Run the poll loop in the background until `cancel` fires. In-flight
    /// tasks are cancelled with it and return to pending.
    pub fn spawn(self: &Arc<Self>, project: ProjectId, cancel: CancellationToken) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            info!(project_id = %project, "Dispatcher started");
            let mut workers = JoinSet::new();
            loop {
                if let Err(err) = dispatcher.poll(project, &mut workers, &cancel).await {
                    warn!(project_id = %project, error = %err, "Dispatch poll failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    joined = workers.join_next(), if !workers.is_empty() => log_join(joined),
                    _ = tokio::time::sleep(dispatcher.settings.poll_interval) => {}
                }
            }
            drain(&mut workers).await;
            info!(project_id = %project, "Dispatcher stopped");
        })
    }

    /// One pass over the graph. Returns how many tasks were started.
    async fn poll(
        self: &Arc<Self>,
        project: ProjectId,
        workers: &mut JoinSet<TaskId>,
        cancel: &CancellationToken,
    ) -> Result<usize, DispatchError> {
        let capacity = self.settings.max_concurrent_tasks.saturating_sub(workers.len());
        if capacity == 0 || cancel.is_cancelled() {
            return Ok(0);
        }

        let tasks = self.tasks.list(project).await?;
        let completed: HashSet<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();
        let ready: Vec<&SpecTask> = tasks.iter().filter(|t| t.is_ready(&completed)).take(capacity).collect();
        if ready.is_empty() {
            return Ok(0);
        }

        let catalog = self.executor.definitions().list_definitions(project).await?;
        let mut launched = 0;
        for task in ready {
            let definition = match self.selector.select(task, &catalog).await {
                Ok(definition) => definition,
                Err(SelectionError::Model(err)) => {
                    warn!(task_id = %task.id, error = %err, "Agent selection failed, will retry next poll");
                    continue;
                }
                Err(err) => {
                    self.abandon(task.id, &err.to_string()).await?;
                    continue;
                }
            };

            let claimed = match self.tasks.claim(task.id, &definition.name).await {
                Ok(claimed) => claimed,
                Err(RepositoryError::Conflict(_)) => {
                    debug!(task_id = %task.id, "Task already claimed");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let token = cancel.child_token();
            self.active.lock().insert(
                claimed.id,
                Assignment {
                    agent: definition.name.clone(),
                    cancel: token.clone(),
                },
            );
            info!(
                task_id = %claimed.id,
                title = %claimed.title,
                agent = %definition.name,
                attempt = claimed.metrics.attempts,
                "Dispatching task"
            );
            self.executor.event_bus().publish_task_event(TaskEvent::TaskDispatched {
                task_id: claimed.id.0,
                project_id: project,
                agent_name: definition.name.clone(),
                attempt: claimed.metrics.attempts,
                dispatched_at: Utc::now(),
            });

            let dispatcher = Arc::clone(self);
            workers.spawn(async move {
                let task_id = claimed.id;
                if let Err(err) = dispatcher.work(claimed, definition, token).await {
                    error!(%task_id, error = %err, "Failed to record task outcome");
                }
                dispatcher.active.lock().remove(&task_id);
                task_id
            });
            launched += 1;
        }
        Ok(launched)
    }

    async fn work(
        &self,
        task: SpecTask,
        definition: AgentDefinition,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError> {
        let started = Instant::now();
        let attempt = self.attempt(&task, &definition, &cancel).await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut current = self
            .tasks
            .find(task.id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("task {}", task.id)))?;
        let bus = self.executor.event_bus();
        match attempt {
            Attempt::Completed(run) => {
                current.complete(&run, elapsed)?;
                self.tasks.update(&current).await?;
                info!(task_id = %current.id, run_id = %run.id, "Task completed");
                bus.publish_task_event(TaskEvent::TaskCompleted {
                    task_id: current.id.0,
                    run_id: run.id,
                    completed_at: Utc::now(),
                });
            }
            Attempt::Cancelled(run) => {
                current.release(run.as_ref(), elapsed)?;
                self.tasks.update(&current).await?;
                info!(task_id = %current.id, "Task cancelled, returned to pending");
            }
            Attempt::Failed { reason, run } => {
                let outcome = current.record_failure(&reason, run.as_ref(), elapsed)?;
                self.tasks.update(&current).await?;
                match outcome {
                    FailureOutcome::Requeued { retry_count } => {
                        warn!(task_id = %current.id, retry_count, reason = %reason, "Task failed, requeued");
                        bus.publish_task_event(TaskEvent::TaskRequeued {
                            task_id: current.id.0,
                            retry_count,
                            reason,
                            requeued_at: Utc::now(),
                        });
                    }
                    FailureOutcome::Exhausted => {
                        error!(task_id = %current.id, reason = %reason, "Task failed, retries exhausted");
                        bus.publish_task_event(TaskEvent::TaskFailed {
                            task_id: current.id.0,
                            reason,
                            failed_at: Utc::now(),
                        });
                        self.skip_dependents(current.project_id, current.id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn attempt(&self, task: &SpecTask, definition: &AgentDefinition, cancel: &CancellationToken) -> Attempt {
        let mut input = task.prompt();
        if task.requires_collaboration {
            match self.agree_on_plan(task, definition, cancel).await {
                Ok(plan) => input.push_str(&format!("\n\n## Approved plan\n\n{plan}")),
                Err(attempt) => return attempt,
            }
        }

        let request = ExecutionRequest::new(definition.clone(), input).with_cancellation(cancel.clone());
        let run = match self.executor.execute(request).await {
            Ok(run) => run,
            Err(err) => return Attempt::failed(err.to_string()),
        };
        match run.status {
            RunStatus::Completed => Attempt::Completed(run),
            RunStatus::Cancelled => Attempt::Cancelled(Some(run)),
            RunStatus::Paused => Attempt::Failed {
                reason: format!(
                    "Paused before finishing: {}",
                    run.summary.as_deref().unwrap_or("no summary")
                ),
                run: Some(run),
            },
            RunStatus::Failed | RunStatus::Running => Attempt::Failed {
                reason: run.error.clone().unwrap_or_else(|| format!("run ended {}", run.status)),
                run: Some(run),
            },
        }
    }

    /// Approved plan text, or the attempt outcome when no plan was agreed.
    async fn agree_on_plan(
        &self,
        task: &SpecTask,
        primary: &AgentDefinition,
        cancel: &CancellationToken,
    ) -> Result<String, Attempt> {
        let Some(coordinator) = &self.consensus else {
            return Err(Attempt::failed("Task requires collaboration but no discussion coordinator is configured"));
        };
        let reviewer_name = task
            .reviewer
            .clone()
            .or_else(|| coordinator.settings().default_reviewer.clone())
            .ok_or_else(|| Attempt::failed("Task requires collaboration but names no reviewer"))?;
        let reviewer = match self
            .executor
            .definitions()
            .get_definition(task.project_id, &reviewer_name)
            .await
        {
            Ok(Some(reviewer)) => reviewer,
            Ok(None) => return Err(Attempt::failed(format!("Unknown reviewer agent: {reviewer_name}"))),
            Err(err) => return Err(Attempt::failed(err.to_string())),
        };

        match coordinator.deliberate(task, primary, &reviewer, cancel).await {
            Ok(discussion) if discussion.is_approved() => Ok(discussion.resolution.unwrap_or_default()),
            Ok(discussion) => Err(Attempt::failed(format!(
                "Discussion {} escalated: {}",
                discussion.id,
                discussion.resolution.unwrap_or_default()
            ))),
            Err(err) if err.is_cancellation() || cancel.is_cancelled() => Err(Attempt::Cancelled(None)),
            Err(err) => Err(Attempt::failed(err.to_string())),
        }
    }

    /// Fail a pending task that cannot be assigned.
    async fn abandon(&self, task_id: TaskId, reason: &str) -> Result<(), DispatchError> {
        let Some(mut task) = self.tasks.find(task_id).await? else {
            return Ok(());
        };
        task.abandon(reason)?;
        self.tasks.update(&task).await?;
        error!(%task_id, reason, "Task cannot be assigned");
        self.executor.event_bus().publish_task_event(TaskEvent::TaskFailed {
            task_id: task_id.0,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        self.skip_dependents(task.project_id, task_id).await
    }

    async fn skip_dependents(&self, project: ProjectId, failed: TaskId) -> Result<(), DispatchError> {
        let tasks = self.tasks.list(project).await?;
        for id in dependents_of(failed, &tasks) {
            let Some(task) = tasks.iter().find(|t| t.id == id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            let mut task = task.clone();
            task.skip()?;
            self.tasks.update(&task).await?;
            info!(task_id = %id, blocked_by = %failed, "Task skipped");
            self.publish_skipped(id, failed);
        }
        Ok(())
    }

    fn publish_skipped(&self, task_id: TaskId, blocked_by: TaskId) {
        self.executor.event_bus().publish_task_event(TaskEvent::TaskSkipped {
            task_id: task_id.0,
            blocked_by: blocked_by.0,
            skipped_at: Utc::now(),
        });
    }
}

/// First non-empty line, shortened to a usable title.
fn title_from(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("Untitled task");
    line.chars().take(MAX_TITLE_CHARS).collect()
}

fn log_join(joined: Option<Result<TaskId, tokio::task::JoinError>>) {
    if let Some(Err(err)) = joined {
        error!(error = %err, "Task worker panicked");
    }
}

async fn drain(workers: &mut JoinSet<TaskId>) {
    while let Some(joined) = workers.join_next().await {
        log_join(Some(joined));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_from_description() {
        assert_eq!(title_from("\n  Fix the login bug\nIt fails on empty passwords"), "Fix the login bug");
        assert_eq!(title_from(""), "Untitled task");
        assert_eq!(title_from(&"x".repeat(200)).len(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_summary_tally() {
        let project = ProjectId::new();
        let mut done = SpecTask::new(project, "a", "", 0);
        done.claim("coder").unwrap();
        let mut skipped = SpecTask::new(project, "b", "", 0);
        skipped.skip().unwrap();
        let pending = SpecTask::new(project, "c", "", 0);

        let summary = DispatchSummary::tally(&[done, skipped, pending]);
        assert_eq!(
            summary,
            DispatchSummary {
                pending: 1,
                in_progress: 1,
                skipped: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_settings_defaults() {
        let settings = DispatcherSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.max_concurrent_tasks, 4);
        assert_eq!(settings.default_max_retries, 2);
    }
}
