// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Executor
//!
//! Runs one agent definition to a terminal status. Each run:
//!
//! 1. creates (or resumes) its [`AgentRun`] record and registers a
//!    cancellation token, derived from its parent's when delegated,
//! 2. takes a global run slot,
//! 3. resolves its tools for its delegation depth,
//! 4. executes its flow (sequential stages first, then the turn loop),
//! 5. persists the terminal status and publishes the matching event.
//!
//! The turn loop alternates model turns and tool calls under three governors
//! (see [`crate::domain::governor`]). A governor stop always ends in `paused`
//! with a summary, never in `failed`.
//!
//! Configuration problems (unknown sub-agents, depth violations, bad resume
//! targets) are returned as `Err` before any run record exists. Problems that
//! happen while the run is underway end the run as `failed` and are returned
//! as `Ok(run)`.

use crate::application::coordination::{ListAvailableAgentsTool, SpawnAgentsTool};
use crate::application::tool_pool::ToolPool;
use crate::domain::agent::{AgentDefinition, FlowType};
use crate::domain::concurrency::RunSlot;
use crate::domain::config::CoordinatorConfig;
use crate::domain::events::RunEvent;
use crate::domain::governor::{
    DoomLoopDetector, LoopVerdict, StepLimiter, StepVerdict, StopReason, TimeoutPolicy,
};
use crate::domain::llm::{LLMError, ModelProvider, ModelResponse};
use crate::domain::repository::{load_lineage_conversation, DefinitionRegistry, RepositoryError, RunRepository};
use crate::domain::run::{
    AgentRun, ConversationMessage, MessageId, MessageRole, RunError, RunId, RunMessage, RunStatus,
    ToolCallRecord, ToolCallRequest,
};
use crate::domain::tool::{Tool, ToolContext, ToolDescriptor, ToolError};
use crate::domain::tool_resolution::ToolResolver;
use crate::infrastructure::event_bus::EventBus;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Appended to a loop flow's reply to end the loop.
pub const LOOP_EXIT_MARKER: &str = "[[DONE]]";

const LOOP_CONTINUE: &str = "Continue working on the task. When everything is finished, \
reply with your final answer and include [[DONE]].";

const RESUME_INSTRUCTION: &str = "Continue your work from where you left off.";

const NO_FINAL_MESSAGE: &str = "Completed without a final message.";

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_depth: u32,
    pub step_ceiling: u32,
    pub delegated_max_steps: u32,
    pub max_concurrent_runs: usize,
    pub max_loop_iterations: u32,
    pub default_timeout: Duration,
    pub grace_period: Duration,
    pub doom_loop_threshold: u32,
}

impl ExecutorSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            max_depth: config.limits.max_depth,
            step_ceiling: config.limits.max_total_steps_per_run,
            delegated_max_steps: config.limits.delegated_max_steps,
            max_concurrent_runs: config.limits.max_concurrent_runs,
            max_loop_iterations: config.limits.max_loop_iterations,
            default_timeout: config.timeouts.default,
            grace_period: config.timeouts.grace_period,
            doom_loop_threshold: config.doom_loop.threshold,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Agent definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {run_id} belongs to agent '{actual}', not '{expected}'")]
    ResumeMismatch {
        run_id: RunId,
        expected: String,
        actual: String,
    },

    #[error("No run slot available: executor is shutting down")]
    Closed,

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, Copy)]
struct ParentLink {
    run_id: RunId,
    depth: u32,
}

/// Everything needed to start (or resume) one run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub definition: AgentDefinition,
    pub input: String,
    pub timeout: Option<Duration>,
    pub resume_from: Option<RunId>,
    parent: Option<ParentLink>,
    cancel: Option<CancellationToken>,
}

impl ExecutionRequest {
    pub fn new(definition: AgentDefinition, input: impl Into<String>) -> Self {
        Self {
            definition,
            input: input.into(),
            timeout: None,
            resume_from: None,
            parent: None,
            cancel: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn resuming(mut self, run_id: RunId) -> Self {
        self.resume_from = Some(run_id);
        self
    }

    /// The run's token becomes a child of `cancel`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run one level below `parent_run`, cancelled together with it.
    pub fn delegated_from(mut self, parent_run: RunId, parent_depth: u32, cancel: CancellationToken) -> Self {
        self.parent = Some(ParentLink {
            run_id: parent_run,
            depth: parent_depth,
        });
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug)]
enum RunOutcome {
    Completed(String),
    Failed(String),
    Paused { summary: String, reason: StopReason },
    Cancelled(String),
}

enum CallFlow {
    Continue,
    Deadline,
    Stop(RunOutcome),
}

enum ToolOutcome {
    Finished(Result<serde_json::Value, ToolError>),
    Cancelled,
    DeadlineReached,
}

enum Turn {
    Response(Result<ModelResponse, LLMError>),
    Cancelled,
    Deadline,
}

/// Mutable state of one run while its flow executes.
struct RunContext {
    run: AgentRun,
    definition: AgentDefinition,
    history: Vec<ConversationMessage>,
    tools: Vec<Arc<dyn Tool>>,
    descriptors: Vec<ToolDescriptor>,
    token: CancellationToken,
    slot: RunSlot,
    deadline: Instant,
    limiter: StepLimiter,
    detector: DoomLoopDetector,
    stages: Vec<AgentDefinition>,
}

impl RunContext {
    fn tool_context(&self, cancel: CancellationToken) -> ToolContext {
        ToolContext {
            project_id: self.run.project_id,
            run_id: self.run.id,
            agent_name: self.run.agent_name.clone(),
            depth: self.run.depth,
            cancel,
            slot: self.slot.clone(),
        }
    }
}

/// Removes a run from the active table however its future ends.
struct ActiveRunGuard {
    executor: Arc<AgentExecutor>,
    run_id: RunId,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.executor.active.lock().remove(&self.run_id);
    }
}

pub struct AgentExecutor {
    model: Arc<dyn ModelProvider>,
    runs: Arc<dyn RunRepository>,
    definitions: Arc<dyn DefinitionRegistry>,
    tools: Arc<ToolPool>,
    resolver: ToolResolver,
    event_bus: EventBus,
    settings: ExecutorSettings,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<RunId, CancellationToken>>,
}

impl AgentExecutor {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        runs: Arc<dyn RunRepository>,
        definitions: Arc<dyn DefinitionRegistry>,
        tools: Arc<ToolPool>,
        event_bus: EventBus,
        settings: ExecutorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            model,
            runs,
            definitions,
            tools,
            resolver: ToolResolver::new(settings.max_depth),
            event_bus,
            slots: Arc::new(Semaphore::new(settings.max_concurrent_runs)),
            settings,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn runs(&self) -> &Arc<dyn RunRepository> {
        &self.runs
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionRegistry> {
        &self.definitions
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Run slots not currently held.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Runs that have not reached a terminal status yet.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.active.lock().keys().copied().collect()
    }

    /// Cancel a run and, transitively, every run it delegated to. Returns
    /// false when the run is not active.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.active.lock().get(&run_id) {
            Some(token) => {
                info!(%run_id, "Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute a request to a terminal run. The returned future is `'static`
    /// so it can be spawned.
    pub fn execute(self: &Arc<Self>, request: ExecutionRequest) -> BoxFuture<'static, Result<AgentRun, ExecutorError>> {
        let executor = Arc::clone(self);
        Box::pin(async move { executor.execute_inner(request).await })
    }

    /// Resume a paused or failed run with the latest version of its definition.
    pub async fn resume(self: &Arc<Self>, run_id: RunId, input: impl Into<String>) -> Result<AgentRun, ExecutorError> {
        let prior = self
            .runs
            .find_run(run_id)
            .await?
            .ok_or(ExecutorError::RunNotFound(run_id))?;
        let definition = self
            .definitions
            .get_definition(prior.project_id, &prior.agent_name)
            .await?
            .ok_or_else(|| ExecutorError::DefinitionNotFound(prior.agent_name.clone()))?;
        self.execute(ExecutionRequest::new(definition, input).resuming(run_id)).await
    }

    async fn execute_inner(self: Arc<Self>, request: ExecutionRequest) -> Result<AgentRun, ExecutorError> {
        let ExecutionRequest {
            definition,
            input,
            timeout,
            resume_from,
            parent,
            cancel,
        } = request;

        // 1. Build the run record and its starting history
        let (run, history) = match resume_from {
            Some(prior_id) => self.prepare_resume(&definition, &input, prior_id, parent).await?,
            None => {
                let budget = definition.step_budget(parent.map_or(0, |p| p.depth + 1), self.settings.delegated_max_steps);
                let run = match parent {
                    Some(p) => AgentRun::new_child(
                        &definition,
                        input.clone(),
                        budget,
                        p.run_id,
                        p.depth,
                        self.settings.max_depth,
                    )?,
                    None => AgentRun::new(&definition, input.clone(), budget),
                };
                (run, Vec::new())
            }
        };

        let stages = if definition.flow_type == FlowType::Sequential && run.resumed_from.is_none() {
            self.resolve_stages(&definition, run.depth).await?
        } else {
            Vec::new()
        };

        // 2. Persist and register before anything can fail mid-run
        self.runs.create_run(&run).await?;
        let token = cancel.map_or_else(CancellationToken::new, |parent| parent.child_token());
        self.active.lock().insert(run.id, token.clone());
        let _guard = ActiveRunGuard {
            executor: Arc::clone(&self),
            run_id: run.id,
        };

        self.event_bus.publish_run_event(RunEvent::RunStarted {
            run_id: run.id,
            project_id: run.project_id,
            agent_name: run.agent_name.clone(),
            parent_run_id: run.parent_run_id,
            depth: run.depth,
            resumed_from: run.resumed_from,
            started_at: Utc::now(),
        });

        let span = info_span!("agent_run", run_id = %run.id, agent = %run.agent_name, depth = run.depth);
        let this = Arc::clone(&self);
        async move {
            info!(resumed_from = ?run.resumed_from, "Run started");
            let run_id = run.id;

            // 3. Take a global slot
            let slot = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                slot = RunSlot::acquire(Arc::clone(&this.slots)) => Some(slot),
            };
            let slot = match slot {
                None => return this.finalize(run, RunOutcome::Cancelled("cancelled before start".into())).await,
                Some(Err(_)) => return this.finalize(run, RunOutcome::Failed(ExecutorError::Closed.to_string())).await,
                Some(Ok(slot)) => slot,
            };

            // 4. Resolve tools for this depth
            let mut available: Vec<Arc<dyn Tool>> = vec![
                Arc::new(SpawnAgentsTool::new(Arc::clone(&this))),
                Arc::new(ListAvailableAgentsTool::new(Arc::clone(&this.definitions))),
            ];
            available.extend(this.tools.project_tools(run.project_id).await);
            let tools = this.resolver.resolve(&definition, run.depth, &available);
            let descriptors = tools.iter().map(|t| t.descriptor().clone()).collect();
            debug!(tool_count = tools.len(), "Resolved tools");

            let timeout = TimeoutPolicy::resolve(timeout, definition.default_timeout, this.settings.default_timeout);
            let limiter = StepLimiter::for_run(&run, this.settings.step_ceiling);
            let mut ctx = RunContext {
                run,
                definition,
                history,
                tools,
                descriptors,
                token,
                slot,
                deadline: Instant::now() + timeout,
                limiter,
                detector: DoomLoopDetector::new(this.settings.doom_loop_threshold),
                stages,
            };

            // 5. Execute the flow
            let opening = if ctx.run.resumed_from.is_some() {
                if input.trim().is_empty() {
                    RESUME_INSTRUCTION.to_string()
                } else {
                    format!("{RESUME_INSTRUCTION}\n\n{input}")
                }
            } else {
                input
            };
            let outcome = match this.drive(&mut ctx, opening).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(%run_id, error = %e, "Run aborted by an internal error");
                    RunOutcome::Failed(e.to_string())
                }
            };
            this.finalize(ctx.run, outcome).await
        }
        .instrument(span)
        .await
    }

    async fn prepare_resume(
        &self,
        definition: &AgentDefinition,
        input: &str,
        prior_id: RunId,
        parent: Option<ParentLink>,
    ) -> Result<(AgentRun, Vec<ConversationMessage>), ExecutorError> {
        let prior = self
            .runs
            .find_run(prior_id)
            .await?
            .ok_or(ExecutorError::RunNotFound(prior_id))?;
        if prior.agent_name != definition.name || prior.project_id != definition.project_id {
            return Err(ExecutorError::ResumeMismatch {
                run_id: prior_id,
                expected: definition.name.clone(),
                actual: prior.agent_name.clone(),
            });
        }

        let depth = match parent {
            Some(p) if p.depth + 1 > self.settings.max_depth => {
                return Err(RunError::MaxDepthExceeded {
                    depth: p.depth + 1,
                    max: self.settings.max_depth,
                }
                .into())
            }
            Some(p) => p.depth + 1,
            None => prior.depth,
        };
        let budget = definition.step_budget(depth, self.settings.delegated_max_steps);
        let mut run = AgentRun::resume(&prior, definition, input, budget, self.settings.step_ceiling)?;
        if let Some(p) = parent {
            run.parent_run_id = Some(p.run_id);
            run.depth = depth;
        }

        let history = load_lineage_conversation(self.runs.as_ref(), prior_id)
            .await?
            .iter()
            .map(RunMessage::to_conversation)
            .collect();
        Ok((run, history))
    }

    async fn resolve_stages(&self, definition: &AgentDefinition, depth: u32) -> Result<Vec<AgentDefinition>, ExecutorError> {
        if definition.sub_agents.is_empty() {
            return Ok(Vec::new());
        }
        if depth + 1 > self.settings.max_depth {
            return Err(RunError::MaxDepthExceeded {
                depth: depth + 1,
                max: self.settings.max_depth,
            }
            .into());
        }
        let mut stages = Vec::with_capacity(definition.sub_agents.len());
        for name in &definition.sub_agents {
            let stage = self
                .definitions
                .get_definition(definition.project_id, name)
                .await?
                .ok_or_else(|| ExecutorError::DefinitionNotFound(name.clone()))?;
            stages.push(stage);
        }
        Ok(stages)
    }

    async fn drive(self: &Arc<Self>, ctx: &mut RunContext, opening: String) -> Result<RunOutcome, ExecutorError> {
        self.append(ctx, ConversationMessage::user(opening.clone())).await?;

        if !ctx.stages.is_empty() {
            if let Some(outcome) = self.run_stages(ctx, &opening).await? {
                return Ok(outcome);
            }
        }
        self.turn_loop(ctx).await
    }

    /// Sequential flow: each stage runs as a delegated child that sees the
    /// original input and every earlier stage's output. Stages share the
    /// parent's deadline; a stage still running when it passes is cancelled
    /// and the parent wraps up.
    async fn run_stages(self: &Arc<Self>, ctx: &mut RunContext, input: &str) -> Result<Option<RunOutcome>, ExecutorError> {
        enum Stage {
            Finished(Result<AgentRun, ExecutorError>),
            Deadline,
        }

        let stages = std::mem::take(&mut ctx.stages);
        let mut outputs: Vec<(String, String)> = Vec::with_capacity(stages.len());

        for stage in stages {
            if ctx.token.is_cancelled() {
                return Ok(Some(RunOutcome::Cancelled("cancelled".into())));
            }
            let deadline = ctx.deadline;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.wrap_up(ctx, StopReason::Timeout).await.map(Some);
            }

            let name = stage.name.clone();
            let mut stage_input = input.to_string();
            for (previous, output) in &outputs {
                stage_input.push_str(&format!("\n\n## Output from {previous}\n{output}"));
            }

            info!(stage = %name, remaining = ?remaining, "Running sequential stage");
            let stage_token = ctx.token.child_token();
            let request = ExecutionRequest::new(stage, stage_input)
                .with_timeout(remaining)
                .delegated_from(ctx.run.id, ctx.run.depth, stage_token.clone());
            let slot = ctx.slot.clone();
            let child = slot.suspend(self.execute(request));
            tokio::pin!(child);

            let race = tokio::select! {
                result = &mut child => Stage::Finished(result),
                _ = sleep_until(deadline) => Stage::Deadline,
            };
            let child = match race {
                Stage::Finished(result) => result,
                Stage::Deadline => {
                    warn!(stage = %name, "Time limit reached during sequential stage");
                    stage_token.cancel();
                    let _ = child.await;
                    return self.wrap_up(ctx, StopReason::Timeout).await.map(Some);
                }
            };

            match child {
                Ok(child) => match child.status {
                    RunStatus::Completed => {
                        outputs.push((name, child.summary.unwrap_or_default()));
                    }
                    RunStatus::Cancelled => {
                        return Ok(Some(RunOutcome::Cancelled(format!("stage '{name}' was cancelled"))));
                    }
                    RunStatus::Paused if Instant::now() >= ctx.deadline => {
                        return self.wrap_up(ctx, StopReason::Timeout).await.map(Some);
                    }
                    RunStatus::Paused => {
                        // The stage hit its own governor; the parent stops resumable too.
                        let summary = child.summary.unwrap_or_default();
                        return Ok(Some(RunOutcome::Paused {
                            summary: format!("stage '{name}' paused: {summary}"),
                            reason: StopReason::StepLimit,
                        }));
                    }
                    status => {
                        let detail = child.error.or(child.summary).unwrap_or_default();
                        return Ok(Some(RunOutcome::Failed(format!(
                            "stage '{name}' ended {status}: {detail}"
                        ))));
                    }
                },
                Err(e) => return Ok(Some(RunOutcome::Failed(format!("stage '{name}' could not start: {e}")))),
            }
        }

        let mut report = String::from("Results from sub-agents:");
        for (name, output) in &outputs {
            report.push_str(&format!("\n\n## {name}\n{output}"));
        }
        self.append(ctx, ConversationMessage::user(report)).await?;
        Ok(None)
    }

    async fn turn_loop(self: &Arc<Self>, ctx: &mut RunContext) -> Result<RunOutcome, ExecutorError> {
        let mut loop_iterations = 0;
        loop {
            if ctx.token.is_cancelled() {
                return Ok(RunOutcome::Cancelled("cancelled".into()));
            }
            if ctx.limiter.check(&ctx.run) == StepVerdict::WrapUp {
                return self.wrap_up(ctx, StopReason::StepLimit).await;
            }
            if Instant::now() >= ctx.deadline {
                return self.wrap_up(ctx, StopReason::Timeout).await;
            }

            let step = self.begin_step(ctx).await?;
            let turn = tokio::select! {
                biased;
                _ = ctx.token.cancelled() => Turn::Cancelled,
                _ = sleep_until(ctx.deadline) => Turn::Deadline,
                result = self.model.invoke(
                    &ctx.definition.model,
                    &ctx.definition.system_prompt,
                    &ctx.history,
                    &ctx.descriptors,
                ) => Turn::Response(result),
            };
            let response = match turn {
                Turn::Cancelled => return Ok(RunOutcome::Cancelled("cancelled".into())),
                Turn::Deadline => return self.wrap_up(ctx, StopReason::Timeout).await,
                Turn::Response(Err(e)) => {
                    warn!(step, error = %e, "Model invocation failed");
                    return Ok(RunOutcome::Failed(format!("model invocation failed: {e}")));
                }
                Turn::Response(Ok(response)) => response,
            };

            let message_id = self.record_assistant(ctx, step, &response).await?;

            if response.is_terminal() {
                let text = response.text.unwrap_or_default();
                if ctx.definition.flow_type == FlowType::Loop
                    && !text.contains(LOOP_EXIT_MARKER)
                    && loop_iterations < self.settings.max_loop_iterations
                {
                    loop_iterations += 1;
                    debug!(loop_iterations, "Loop flow continuing");
                    self.append(ctx, ConversationMessage::user(LOOP_CONTINUE)).await?;
                    continue;
                }
                return Ok(RunOutcome::Completed(completion_summary(&text)));
            }

            for (index, call) in response.tool_calls.iter().enumerate() {
                match self.handle_tool_call(ctx, message_id, step, call).await? {
                    CallFlow::Continue => {}
                    CallFlow::Stop(outcome) => return Ok(outcome),
                    CallFlow::Deadline => {
                        for skipped in &response.tool_calls[index + 1..] {
                            self.refuse_call(ctx, message_id, step, skipped, "not executed: time limit reached")
                                .await?;
                        }
                        return self.wrap_up(ctx, StopReason::Timeout).await;
                    }
                }
            }
        }
    }

    async fn handle_tool_call(
        &self,
        ctx: &mut RunContext,
        message_id: MessageId,
        step: u32,
        call: &ToolCallRequest,
    ) -> Result<CallFlow, ExecutorError> {
        if ctx.token.is_cancelled() {
            return Ok(CallFlow::Stop(RunOutcome::Cancelled("cancelled".into())));
        }

        match ctx.detector.observe(&call.name, &call.arguments) {
            LoopVerdict::Allow => {}
            LoopVerdict::Refuse => {
                let warning = ctx.detector.warning(&call.name);
                warn!(tool = %call.name, "Refusing repeated identical tool call");
                self.governor_triggered(ctx, StopReason::RepeatedToolCall);
                self.refuse_call(ctx, message_id, step, call, &warning).await?;
                return Ok(CallFlow::Continue);
            }
            LoopVerdict::HardStop => {
                warn!(tool = %call.name, "Repeated tool call after warning, stopping run");
                self.governor_triggered(ctx, StopReason::RepeatedToolCall);
                self.refuse_call(ctx, message_id, step, call, "repeated identical call after warning")
                    .await?;
                let summary = fallback_summary(ctx, StopReason::RepeatedToolCall);
                return Ok(CallFlow::Stop(RunOutcome::Paused {
                    summary,
                    reason: StopReason::RepeatedToolCall,
                }));
            }
        }

        if Instant::now() >= ctx.deadline {
            self.refuse_call(ctx, message_id, step, call, "not executed: time limit reached")
                .await?;
            return Ok(CallFlow::Deadline);
        }

        let Some(tool) = ctx.tools.iter().find(|t| t.name() == call.name).cloned() else {
            let reason = format!("tool '{}' is not available to this agent", call.name);
            self.refuse_call(ctx, message_id, step, call, &reason).await?;
            return Ok(CallFlow::Continue);
        };

        let mut record = ToolCallRecord::start(ctx.run.id, message_id, step, call);
        self.runs.append_tool_call(&record).await?;
        self.event_bus.publish_run_event(RunEvent::ToolCallStarted {
            run_id: ctx.run.id,
            tool_call_id: record.id,
            tool_name: call.name.clone(),
            started_at: Utc::now(),
        });

        let started = Instant::now();
        let tool_ctx = ctx.tool_context(ctx.token.child_token());
        let outcome = invoke_tool(tool.as_ref(), &tool_ctx, call.arguments.clone(), ctx.deadline, &ctx.token).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (body, is_error, flow) = match outcome {
            ToolOutcome::Finished(Ok(value)) => {
                let body = render_output(&value);
                record.complete(value, duration_ms)?;
                (body, false, CallFlow::Continue)
            }
            ToolOutcome::Finished(Err(e)) => {
                let body = e.to_string();
                record.fail(body.clone(), duration_ms)?;
                (body, true, CallFlow::Continue)
            }
            ToolOutcome::Cancelled => {
                record.fail("cancelled", duration_ms)?;
                (
                    "cancelled".to_string(),
                    true,
                    CallFlow::Stop(RunOutcome::Cancelled("cancelled".into())),
                )
            }
            ToolOutcome::DeadlineReached => {
                let body = "interrupted: time limit reached".to_string();
                record.fail(body.clone(), duration_ms)?;
                (body, true, CallFlow::Deadline)
            }
        };
        self.runs.update_tool_call(&record).await?;
        self.event_bus.publish_run_event(RunEvent::ToolCallFinished {
            run_id: ctx.run.id,
            tool_call_id: record.id,
            tool_name: call.name.clone(),
            is_error,
            duration_ms,
            finished_at: Utc::now(),
        });
        debug!(tool = %call.name, duration_ms, is_error, "Tool call finished");

        self.append(ctx, ConversationMessage::tool_result(call.id.clone(), body, is_error))
            .await?;
        Ok(flow)
    }

    /// Governor stop: one tool-less turn to produce a summary, bounded by the
    /// grace period, then pause.
    async fn wrap_up(&self, ctx: &mut RunContext, reason: StopReason) -> Result<RunOutcome, ExecutorError> {
        warn!(reason = reason.describe(), steps = ctx.run.step_count, "Governor triggered");
        self.governor_triggered(ctx, reason);
        self.append(ctx, ConversationMessage::system(reason.wrap_up_instruction()))
            .await?;
        let step = self.begin_step(ctx).await?;

        let reply = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => None,
            result = tokio::time::timeout(
                self.settings.grace_period,
                self.model.invoke(&ctx.definition.model, &ctx.definition.system_prompt, &ctx.history, &[]),
            ) => Some(result),
        };

        let summary = match reply {
            None => return Ok(RunOutcome::Cancelled("cancelled during wrap-up".into())),
            Some(Err(_elapsed)) => {
                warn!("No summary within the grace period");
                ctx.token.cancel();
                fallback_summary(ctx, reason)
            }
            Some(Ok(Err(e))) => {
                warn!(error = %e, "Wrap-up turn failed");
                fallback_summary(ctx, reason)
            }
            Some(Ok(Ok(response))) => {
                let message_id = self.record_assistant(ctx, step, &response).await?;
                for call in &response.tool_calls {
                    self.refuse_call(ctx, message_id, step, call, "tools are disabled for the wrap-up turn")
                        .await?;
                }
                match response.text.filter(|t| !t.trim().is_empty()) {
                    Some(text) => text,
                    None => fallback_summary(ctx, reason),
                }
            }
        };
        Ok(RunOutcome::Paused { summary, reason })
    }

    async fn begin_step(&self, ctx: &mut RunContext) -> Result<u32, ExecutorError> {
        let step = ctx.run.record_step()?;
        self.runs.update_run(&ctx.run).await?;
        self.event_bus.publish_run_event(RunEvent::StepStarted {
            run_id: ctx.run.id,
            step,
            started_at: Utc::now(),
        });
        debug!(step, "Step started");
        Ok(step)
    }

    async fn append(&self, ctx: &mut RunContext, message: ConversationMessage) -> Result<MessageId, ExecutorError> {
        let record = RunMessage::new(ctx.run.id, ctx.run.step_count, message.clone());
        self.runs.append_message(&record).await?;
        ctx.history.push(message);
        Ok(record.id)
    }

    async fn record_assistant(
        &self,
        ctx: &mut RunContext,
        step: u32,
        response: &ModelResponse,
    ) -> Result<MessageId, ExecutorError> {
        let message = ConversationMessage::assistant(response.text.clone(), response.tool_calls.clone());
        let record = RunMessage::new(ctx.run.id, step, message.clone()).with_usage(response.usage);
        self.runs.append_message(&record).await?;
        ctx.history.push(message);
        Ok(record.id)
    }

    /// Record a call that is never executed and tell the model why.
    async fn refuse_call(
        &self,
        ctx: &mut RunContext,
        message_id: MessageId,
        step: u32,
        call: &ToolCallRequest,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        let record = ToolCallRecord::refused(ctx.run.id, message_id, step, call, reason);
        self.runs.append_tool_call(&record).await?;
        self.append(ctx, ConversationMessage::tool_result(call.id.clone(), reason, true))
            .await?;
        Ok(())
    }

    fn governor_triggered(&self, ctx: &RunContext, reason: StopReason) {
        self.event_bus.publish_run_event(RunEvent::GovernorTriggered {
            run_id: ctx.run.id,
            reason: reason.describe().to_string(),
            triggered_at: Utc::now(),
        });
    }

    async fn finalize(&self, mut run: AgentRun, outcome: RunOutcome) -> Result<AgentRun, ExecutorError> {
        let now = Utc::now();
        let event = match outcome {
            RunOutcome::Completed(summary) => {
                run.complete(summary)?;
                info!(steps = run.step_count, "Run completed");
                RunEvent::RunCompleted {
                    run_id: run.id,
                    step_count: run.step_count,
                    completed_at: now,
                }
            }
            RunOutcome::Failed(error) => {
                warn!(error = %error, "Run failed");
                run.fail(error.clone())?;
                RunEvent::RunFailed {
                    run_id: run.id,
                    error,
                    failed_at: now,
                }
            }
            RunOutcome::Paused { summary, reason } => {
                run.pause(summary)?;
                info!(reason = reason.describe(), steps = run.step_count, "Run paused");
                RunEvent::RunPaused {
                    run_id: run.id,
                    summary: run.summary.clone().unwrap_or_default(),
                    paused_at: now,
                }
            }
            RunOutcome::Cancelled(reason) => {
                info!(reason = %reason, "Run cancelled");
                run.cancel(reason.clone())?;
                RunEvent::RunCancelled {
                    run_id: run.id,
                    reason,
                    cancelled_at: now,
                }
            }
        };
        self.runs.update_run(&run).await?;
        self.event_bus.publish_run_event(event);
        Ok(run)
    }
}

async fn invoke_tool(
    tool: &dyn Tool,
    tool_ctx: &ToolContext,
    input: serde_json::Value,
    deadline: Instant,
    run_token: &CancellationToken,
) -> ToolOutcome {
    enum Race {
        Done(Result<serde_json::Value, ToolError>),
        Cancelled,
        Deadline,
    }

    let call = tool.call(tool_ctx, input);
    tokio::pin!(call);

    if tool.observes_cancellation() {
        // Cancellation reaches the tool through its token; wait for it to wind down.
        let race = tokio::select! {
            result = &mut call => Race::Done(result),
            _ = sleep_until(deadline) => Race::Deadline,
        };
        match race {
            Race::Done(result) => ToolOutcome::Finished(result),
            Race::Cancelled | Race::Deadline => {
                tool_ctx.cancel.cancel();
                let _ = call.await;
                ToolOutcome::DeadlineReached
            }
        }
    } else {
        let race = tokio::select! {
            result = &mut call => Race::Done(result),
            _ = run_token.cancelled() => Race::Cancelled,
            _ = sleep_until(deadline) => Race::Deadline,
        };
        match race {
            Race::Done(result) => ToolOutcome::Finished(result),
            Race::Cancelled => ToolOutcome::Cancelled,
            Race::Deadline => ToolOutcome::DeadlineReached,
        }
    }
}

fn render_output(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn completion_summary(text: &str) -> String {
    let cleaned = text.replace(LOOP_EXIT_MARKER, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        NO_FINAL_MESSAGE.to_string()
    } else {
        cleaned.to_string()
    }
}

fn fallback_summary(ctx: &RunContext, reason: StopReason) -> String {
    let last_progress = ctx
        .history
        .iter()
        .rev()
        .filter(|m| m.role == MessageRole::Assistant)
        .map(ConversationMessage::text_content)
        .find(|t| !t.trim().is_empty());

    let mut summary = format!(
        "Paused after {} steps ({}).",
        ctx.run.step_count,
        reason.describe()
    );
    if let Some(text) = last_progress {
        let excerpt: String = text.chars().take(500).collect();
        summary.push_str(&format!(" Last progress: {excerpt}"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_summary_strips_loop_marker() {
        assert_eq!(completion_summary("All done [[DONE]]"), "All done");
        assert_eq!(completion_summary("  [[DONE]] "), NO_FINAL_MESSAGE);
    }

    #[test]
    fn test_render_output() {
        assert_eq!(render_output(&serde_json::json!("plain")), "plain");
        assert_eq!(render_output(&serde_json::json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_settings_follow_config_defaults() {
        let settings = ExecutorSettings::default();
        assert_eq!(settings.max_depth, 2);
        assert_eq!(settings.step_ceiling, 500);
        assert_eq!(settings.delegated_max_steps, 50);
        assert_eq!(settings.grace_period, Duration::from_secs(30));
    }
}
