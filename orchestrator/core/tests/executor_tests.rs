// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the turn loop: completion, tool calls, the three
//! governors, flow types and resume across attempts.

mod common;

use common::{call, say, Harness, Turn};
use serde_json::json;
use std::time::Duration;
use switchyard_core::application::executor::{ExecutionRequest, ExecutorError, ExecutorSettings};
use switchyard_core::domain::agent::FlowType;
use switchyard_core::domain::events::RunEvent;
use switchyard_core::domain::repository::{PageRequest, RunFilter, RunRepository};
use switchyard_core::domain::run::{MessageRole, RunError, RunStatus, ToolCallStatus};
use switchyard_core::infrastructure::event_bus::DomainEvent;

/// Test 1: A single text reply completes the run
#[tokio::test]
async fn test_single_reply_completes() {
    let h = Harness::new();
    let agent = h.install(h.agent("solo")).await;
    h.model.script("solo", vec![say("The answer is 42.")]).await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "What is the answer?")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.summary.as_deref(), Some("The answer is 42."));
    assert_eq!(run.step_count, 1);
    assert!(run.ended_at.is_some());

    let messages = h.runs.load_conversation(run.id).await.unwrap();
    let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);

    let stored = h.runs.find_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed, "Terminal status must be persisted");
}

/// Test 2: Tool calls are executed, recorded and fed back to the model
#[tokio::test]
async fn test_tool_call_round_trip() {
    let h = Harness::new();
    let agent = h.install(h.agent("reader")).await;
    h.model
        .script(
            "reader",
            vec![call("fs.read", json!({"path": "README.md"})), say("It is a readme.")],
        )
        .await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Read the readme")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_count, 2);

    let calls = h.tool_calls(run.id).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tool_name, "fs.read");
    assert_eq!(calls[0].status, ToolCallStatus::Completed);
    assert_eq!(calls[0].step, 1);
    assert!(calls[0].duration_ms.is_some());

    let invocations = h.model.invocations("reader").await;
    let second_turn = &invocations[1];
    let result = second_turn.history.last().unwrap();
    assert_eq!(result.role, MessageRole::ToolResult);
    assert!(result.text_content().contains("fs.read ok"));
    assert!(!result.content.is_error);
}

/// Test 3: A failing tool is reported to the model, not fatal to the run
#[tokio::test]
async fn test_tool_error_is_fed_back() {
    let h = Harness::new();
    let agent = h.install(h.agent("reader")).await;
    h.model
        .script("reader", vec![call("fs.read", json!({"fail": true})), say("Could not read it.")])
        .await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Read")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let calls = h.tool_calls(run.id).await;
    assert_eq!(calls[0].status, ToolCallStatus::Error);

    let invocations = h.model.invocations("reader").await;
    let second_turn = &invocations[1];
    assert!(second_turn.history.last().unwrap().content.is_error);
}

/// Test 4: Only whitelisted tools are offered; others are refused
#[tokio::test]
async fn test_whitelist_limits_tools() {
    let h = Harness::new();
    let agent = h.install(h.agent("narrow").with_tools(["fs.read"])).await;
    h.model
        .script("narrow", vec![call("fs.write", json!({"path": "x"})), say("ok")])
        .await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Write x")).await.unwrap();

    let invocations = h.model.invocations("narrow").await;
    let first_turn = &invocations[0];
    assert_eq!(first_turn.tools, vec!["fs.read".to_string()]);

    let calls = h.tool_calls(run.id).await;
    assert_eq!(calls[0].status, ToolCallStatus::Error);
    assert!(calls[0].output.as_ref().unwrap()["error"]
        .as_str()
        .unwrap()
        .contains("not available"));
}

/// Test 5: Step budget exhausted → one tool-less wrap-up turn → paused
#[tokio::test]
async fn test_step_limit_wraps_up_and_pauses() {
    let h = Harness::new();
    let agent = h.install(h.agent("worker").with_max_steps(2)).await;
    h.model
        .script(
            "worker",
            vec![
                call("fs.read", json!({"path": "a"})),
                call("fs.read", json!({"path": "b"})),
                say("Read a and b; c is still left."),
            ],
        )
        .await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Read a, b and c")).await.unwrap();

    assert_eq!(run.status, RunStatus::Paused, "Governor stops pause, never fail");
    assert_eq!(run.step_count, 3);
    assert_eq!(run.summary.as_deref(), Some("Read a and b; c is still left."));

    let invocations = h.model.invocations("worker").await;
    assert_eq!(invocations.len(), 3);
    assert!(invocations[2].tools.is_empty(), "Wrap-up turn must not offer tools");
    assert_eq!(invocations[2].history.last().unwrap().role, MessageRole::System);
}

/// Test 6: Tool calls made during the wrap-up turn are refused
#[tokio::test]
async fn test_wrap_up_refuses_tool_calls() {
    let h = Harness::new();
    let agent = h.install(h.agent("stubborn").with_max_steps(1)).await;
    h.model.repeat("stubborn", call("fs.read", json!({"path": "a"}))).await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Go")).await.unwrap();

    assert_eq!(run.status, RunStatus::Paused);
    assert!(!run.summary.as_deref().unwrap().is_empty());

    let calls = h.tool_calls(run.id).await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].status, ToolCallStatus::Completed);
    assert_eq!(calls[1].status, ToolCallStatus::Error);
    assert_eq!(calls[1].step, 2);
}

/// Test 7: Identical calls are refused on the third repeat and stop the run on the fourth
#[tokio::test]
async fn test_doom_loop_refuses_then_pauses() {
    let h = Harness::new();
    let agent = h.install(h.agent("looper")).await;
    h.model.repeat("looper", call("fs.read", json!({"path": "same.txt"}))).await;

    let mut events = h.events.subscribe();
    let run = h.executor.execute(ExecutionRequest::new(agent, "Read it")).await.unwrap();

    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.step_count, 4);
    assert!(run.summary.as_deref().unwrap().contains("repeated identical tool calls"));

    let statuses: Vec<_> = h.tool_calls(run.id).await.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![
            ToolCallStatus::Completed,
            ToolCallStatus::Completed,
            ToolCallStatus::Error,
            ToolCallStatus::Error,
        ]
    );

    let invocations = h.model.invocations("looper").await;
    let fourth_turn = &invocations[3];
    let warning = fourth_turn.history.last().unwrap();
    assert!(warning.content.is_error);
    assert!(warning.text_content().contains("identical arguments"));

    let mut governor_events = 0;
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::Run(RunEvent::GovernorTriggered { .. }) = event {
            governor_events += 1;
        }
    }
    assert_eq!(governor_events, 2);
}

/// Test 8: A model that never answers is stopped at the deadline and wraps up
#[tokio::test(start_paused = true)]
async fn test_timeout_wraps_up() {
    let h = Harness::new();
    let agent = h.install(h.agent("slow").with_timeout(Duration::from_secs(10))).await;
    h.model
        .script("slow", vec![Turn::Hang, say("Ran out of time while reading.")])
        .await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Read slowly")).await.unwrap();

    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.summary.as_deref(), Some("Ran out of time while reading."));
    assert_eq!(run.step_count, 2);
}

/// Test 9: A silent wrap-up turn is abandoned after the grace period
#[tokio::test(start_paused = true)]
async fn test_grace_period_expiry_still_pauses() {
    let h = Harness::new();
    let agent = h.install(h.agent("silent")).await;
    h.model.repeat("silent", Turn::Hang).await;

    let request = ExecutionRequest::new(agent, "Anything").with_timeout(Duration::from_secs(5));
    let run = h.executor.execute(request).await.unwrap();

    assert_eq!(run.status, RunStatus::Paused);
    let summary = run.summary.unwrap();
    assert!(summary.contains("time limit reached"), "unexpected summary: {summary}");
}

/// Test 10: Model errors fail the run
#[tokio::test]
async fn test_model_failure_fails_run() {
    let h = Harness::new();
    let agent = h.install(h.agent("flaky")).await;
    h.model.script("flaky", vec![Turn::Fail("HTTP 500".into())]).await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Hi")).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("HTTP 500"));
}

/// Test 11: Resume continues the step counter and replays the whole lineage
#[tokio::test]
async fn test_resume_carries_history_and_steps() {
    let h = Harness::new();
    let agent = h.install(h.agent("writer").with_max_steps(1)).await;
    h.model
        .script(
            "writer",
            vec![
                call("fs.read", json!({"path": "draft.md"})),
                say("Read the draft, still need to edit it."),
                say("Edited the draft."),
            ],
        )
        .await;

    let first = h.executor.execute(ExecutionRequest::new(agent, "Edit the draft")).await.unwrap();
    assert_eq!(first.status, RunStatus::Paused);
    assert_eq!(first.step_count, 2);

    let second = h.executor.resume(first.id, "").await.unwrap();

    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.resumed_from, Some(first.id));
    assert_eq!(second.step_count, 3, "Step count is cumulative across resumes");
    assert_eq!(second.attempt_start_step, 2);

    let prior_messages = h.runs.load_conversation(first.id).await.unwrap();
    let own_messages = h.runs.load_conversation(second.id).await.unwrap();
    assert_eq!(own_messages.len(), 2, "A resumed run stores only its new messages");

    let resumed_turn = h.model.invocations("writer").await.pop().unwrap();
    assert_eq!(resumed_turn.history.len(), prior_messages.len() + 1);
    assert_eq!(resumed_turn.history[0].text_content(), "Edit the draft");
    assert!(resumed_turn.history.last().unwrap().text_content().starts_with("Continue your work"));
}

/// Test 12: Completed runs cannot be resumed
#[tokio::test]
async fn test_completed_run_is_not_resumable() {
    let h = Harness::new();
    let agent = h.install(h.agent("done")).await;
    h.model.script("done", vec![say("finished")]).await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Go")).await.unwrap();
    let err = h.executor.resume(run.id, "again").await.unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::Run(RunError::NotResumable(RunStatus::Completed))
    ));
}

/// Test 13: Resume is refused once the lineage used up the step ceiling
#[tokio::test]
async fn test_resume_refused_at_ceiling() {
    let settings = ExecutorSettings {
        step_ceiling: 3,
        ..ExecutorSettings::default()
    };
    let h = Harness::with_settings(settings);
    let agent = h.install(h.agent("greedy")).await;
    h.model
        .script(
            "greedy",
            vec![
                call("web.fetch", json!({"n": 1})),
                call("web.fetch", json!({"n": 2})),
                say("stopping"),
            ],
        )
        .await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Fetch")).await.unwrap();
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.step_count, 3, "Budget keeps one step of headroom for the wrap-up turn");

    let err = h.executor.resume(run.id, "").await.unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Run(RunError::StepCeilingReached { steps: 3, ceiling: 3 })
    ));
}

/// Test 14: Sequential flow runs each stage in order and feeds outputs forward
#[tokio::test]
async fn test_sequential_flow_runs_stages_in_order() {
    let h = Harness::new();
    h.install(h.agent("drafter")).await;
    h.install(h.agent("reviewer")).await;
    let pipeline = h
        .install(
            h.agent("pipeline")
                .with_flow(FlowType::Sequential, vec!["drafter".into(), "reviewer".into()]),
        )
        .await;
    h.model.repeat("drafter", say("draft v1")).await;
    h.model.repeat("reviewer", say("looks good")).await;
    h.model.script("pipeline", vec![say("Published draft v1.")]).await;

    let run = h.executor.execute(ExecutionRequest::new(pipeline, "Write a post")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.summary.as_deref(), Some("Published draft v1."));

    let children = h.runs.find_children(run.id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.depth == 1 && c.status == RunStatus::Completed));
    let reviewer = children.iter().find(|c| c.agent_name == "reviewer").unwrap();
    assert!(reviewer.input.contains("draft v1"), "Later stages see earlier output");

    let invocations = h.model.invocations("pipeline").await;
    let own_turn = &invocations[0];
    let report = own_turn.history.last().unwrap().text_content();
    assert!(report.contains("Results from sub-agents"));
    assert!(report.contains("looks good"));
}

/// Test 15: A failing stage fails the sequential run
#[tokio::test]
async fn test_sequential_stage_failure_fails_run() {
    let h = Harness::new();
    h.install(h.agent("drafter")).await;
    let pipeline = h
        .install(h.agent("pipeline").with_flow(FlowType::Sequential, vec!["drafter".into()]))
        .await;
    h.model.script("drafter", vec![Turn::Fail("quota".into())]).await;

    let run = h.executor.execute(ExecutionRequest::new(pipeline, "Write")).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("stage 'drafter'"));
    assert!(h.model.invocations("pipeline").await.is_empty());
}

/// Test 16: An unknown stage is rejected before any run exists
#[tokio::test]
async fn test_sequential_unknown_stage_rejected_up_front() {
    let h = Harness::new();
    let pipeline = h
        .install(h.agent("pipeline").with_flow(FlowType::Sequential, vec!["ghost".into()]))
        .await;

    let err = h.executor.execute(ExecutionRequest::new(pipeline, "Write")).await.unwrap_err();

    assert!(matches!(err, ExecutorError::DefinitionNotFound(name) if name == "ghost"));
    let runs = h
        .runs
        .list_runs(&RunFilter::default(), &PageRequest::first(10))
        .await
        .unwrap();
    assert!(runs.items.is_empty(), "Configuration errors must not leave partial runs");
}

/// Test 17: A stage still running at the parent's deadline is cancelled and the parent wraps up
#[tokio::test(start_paused = true)]
async fn test_sequential_stage_bounded_by_parent_deadline() {
    let h = Harness::new();
    h.install(h.agent("drafter")).await;
    h.install(h.agent("reviewer")).await;
    let pipeline = h
        .install(
            h.agent("pipeline")
                .with_flow(FlowType::Sequential, vec!["drafter".into(), "reviewer".into()])
                .with_timeout(Duration::from_secs(10)),
        )
        .await;
    h.model.repeat("drafter", Turn::Hang).await;
    h.model.script("pipeline", vec![say("Drafting did not finish in time.")]).await;

    let started = tokio::time::Instant::now();
    let run = h.executor.execute(ExecutionRequest::new(pipeline, "Write")).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.summary.as_deref(), Some("Drafting did not finish in time."));
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed <= Duration::from_secs(40), "Run outlived its deadline: {elapsed:?}");

    let children = h.runs.find_children(run.id).await.unwrap();
    assert_eq!(children.len(), 1, "Later stages never start after the deadline");
    assert!(children[0].status.is_terminal());
    assert!(h.model.invocations("reviewer").await.is_empty());
    assert!(h.executor.active_runs().is_empty());
}

/// Test 18: A stage stopped by its own governor pauses the parent instead of failing it
#[tokio::test]
async fn test_sequential_paused_stage_pauses_parent() {
    let h = Harness::new();
    h.install(h.agent("drafter").with_max_steps(1)).await;
    let pipeline = h
        .install(h.agent("pipeline").with_flow(FlowType::Sequential, vec!["drafter".into()]))
        .await;
    h.model
        .script(
            "drafter",
            vec![call("fs.read", json!({"path": "notes"})), say("Half a draft.")],
        )
        .await;

    let run = h.executor.execute(ExecutionRequest::new(pipeline, "Write")).await.unwrap();

    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.summary.as_deref(), Some("stage 'drafter' paused: Half a draft."));
    assert!(run.error.is_none());
    assert!(h.model.invocations("pipeline").await.is_empty());
}

/// Test 19: Loop flow continues until the exit marker appears
#[tokio::test]
async fn test_loop_flow_runs_until_marker() {
    let h = Harness::new();
    let agent = h.install(h.agent("iterator").with_flow(FlowType::Loop, vec![])).await;
    h.model
        .script(
            "iterator",
            vec![say("pass one"), say("pass two"), say("all tests pass [[DONE]]")],
        )
        .await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Fix the tests")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_count, 3);
    assert_eq!(run.summary.as_deref(), Some("all tests pass"));
}

/// Test 20: Loop flow stops after the configured number of continuations
#[tokio::test]
async fn test_loop_flow_iteration_cap() {
    let settings = ExecutorSettings {
        max_loop_iterations: 2,
        ..ExecutorSettings::default()
    };
    let h = Harness::with_settings(settings);
    let agent = h.install(h.agent("iterator").with_flow(FlowType::Loop, vec![])).await;
    h.model.repeat("iterator", say("still going")).await;

    let run = h.executor.execute(ExecutionRequest::new(agent, "Fix")).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_count, 3);
}

/// Test 21: Lifecycle events are published in order
#[tokio::test]
async fn test_lifecycle_events() {
    let h = Harness::new();
    let agent = h.install(h.agent("solo")).await;
    h.model
        .script("solo", vec![call("fs.read", json!({"path": "a"})), say("done")])
        .await;

    let mut events = h.events.subscribe();
    let run = h.executor.execute(ExecutionRequest::new(agent, "Go")).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(DomainEvent::Run(event)) = events.try_recv() {
        assert_eq!(event.run_id(), run.id);
        kinds.push(match event {
            RunEvent::RunStarted { .. } => "started",
            RunEvent::StepStarted { .. } => "step",
            RunEvent::ToolCallStarted { .. } => "tool_start",
            RunEvent::ToolCallFinished { .. } => "tool_end",
            RunEvent::RunCompleted { .. } => "completed",
            _ => "other",
        });
    }
    assert_eq!(
        kinds,
        vec!["started", "step", "tool_start", "tool_end", "step", "completed"]
    );
    assert!(h.executor.active_runs().is_empty());
}
