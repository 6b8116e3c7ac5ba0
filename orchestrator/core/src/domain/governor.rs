// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Run Governors
//!
//! Three independent limits keep an agent run from spinning forever:
//!
//! | Governor | Trigger | Effect |
//! |----------|---------|--------|
//! | [`StepLimiter`] | step budget or global ceiling used up | one wrap-up turn without tools, then paused |
//! | [`TimeoutPolicy`] | wall-clock deadline passed | wrap-up turn within a grace period, then paused |
//! | [`DoomLoopDetector`] | same tool and arguments repeated | refuse with a warning, then paused |
//!
//! Every stop goes through `paused` with a non-empty summary so the run can be
//! resumed later.

use crate::domain::run::AgentRun;
use sha2::{Digest, Sha256};
use std::time::Duration;

pub const WRAP_UP_STEP_LIMIT: &str = "You have reached your step limit. Tools are now disabled. \
Reply with a concise summary of what you accomplished, what remains to be done and any partial results.";

pub const WRAP_UP_TIMEOUT: &str = "You have run out of time. Tools are now disabled. \
Reply immediately with a concise summary of what you accomplished and what remains to be done.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StepLimit,
    Timeout,
    RepeatedToolCall,
}

impl StopReason {
    pub fn wrap_up_instruction(&self) -> &'static str {
        match self {
            StopReason::Timeout => WRAP_UP_TIMEOUT,
            StopReason::StepLimit | StopReason::RepeatedToolCall => WRAP_UP_STEP_LIMIT,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            StopReason::StepLimit => "step limit reached",
            StopReason::Timeout => "time limit reached",
            StopReason::RepeatedToolCall => "repeated identical tool calls",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepVerdict {
    Continue,
    WrapUp,
}

/// Step budget for one attempt, clamped so the lineage never passes `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct StepLimiter {
    budget: u32,
}

impl StepLimiter {
    /// One step of headroom below the ceiling is kept for the wrap-up turn.
    pub fn for_run(run: &AgentRun, ceiling: u32) -> Self {
        let headroom = ceiling.saturating_sub(run.attempt_start_step + 1);
        let budget = run.max_steps.map_or(headroom, |max| max.min(headroom));
        Self { budget }
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn check(&self, run: &AgentRun) -> StepVerdict {
        if run.steps_this_attempt() >= self.budget {
            StepVerdict::WrapUp
        } else {
            StepVerdict::Continue
        }
    }
}

pub struct TimeoutPolicy;

impl TimeoutPolicy {
    /// Explicit request beats the definition's default, which beats the
    /// system default.
    pub fn resolve(requested: Option<Duration>, definition: Option<Duration>, system: Duration) -> Duration {
        requested.or(definition).unwrap_or(system)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    Allow,
    /// Refuse this call and warn the model.
    Refuse,
    /// The model repeated the call after being warned.
    HardStop,
}

/// Watches consecutive tool calls for an identical name and argument hash.
#[derive(Debug, Clone)]
pub struct DoomLoopDetector {
    threshold: u32,
    previous: Option<(String, String)>,
    consecutive: u32,
    warned: bool,
}

impl DoomLoopDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(2),
            previous: None,
            consecutive: 0,
            warned: false,
        }
    }

    pub fn observe(&mut self, tool_name: &str, arguments: &serde_json::Value) -> LoopVerdict {
        let key = (tool_name.to_string(), argument_hash(arguments));
        if self.previous.as_ref() == Some(&key) {
            self.consecutive += 1;
        } else {
            self.previous = Some(key);
            self.consecutive = 1;
            self.warned = false;
        }

        if self.consecutive < self.threshold {
            return LoopVerdict::Allow;
        }
        if self.warned {
            LoopVerdict::HardStop
        } else {
            self.warned = true;
            LoopVerdict::Refuse
        }
    }

    pub fn warning(&self, tool_name: &str) -> String {
        format!(
            "Refused: you called `{tool_name}` with identical arguments {} times in a row. \
The result will not change. Try a different approach or finish with a summary; \
repeating this call again will stop the run.",
            self.consecutive
        )
    }
}

/// SHA-256 over the canonical JSON encoding. `serde_json` maps keep keys
/// sorted, so argument order does not affect the hash.
pub fn argument_hash(arguments: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(arguments).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
