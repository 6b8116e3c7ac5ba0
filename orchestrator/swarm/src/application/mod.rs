// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod consensus;
pub mod dispatcher;
pub mod selector;

pub use consensus::{ConsensusError, ConsensusSettings, DiscussionCoordinator};
pub use dispatcher::{
    DispatchError, DispatchRequest, DispatchSummary, DispatcherSettings, NewTask, TaskDispatcher,
};
pub use selector::{
    AgentSelector, HybridSelector, ModelBasedSelector, RuleBasedSelector, SelectionError, SelectionRule,
};
