// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `switchyard-swarm` - Planned Multi-Agent Work
//!
//! Turns a piece of work into a dependency graph of tasks and drives it to
//! completion through the core executor.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `SpecTask`, `TaskGraphSpec`, `Discussion`, repository ports |
//! | [`application`] | Application | `TaskDispatcher`, agent selectors, `DiscussionCoordinator` |
//! | [`infrastructure`] | Infrastructure | In-memory task and discussion repositories |
//!
//! ## Key Concepts
//!
//! - **Task graph**: tasks connected by "blocks" edges. Graphs are validated
//!   (unknown predecessors, duplicate titles, cycles) before anything is stored.
//! - **Dispatch**: a polling loop that starts every unblocked task under an
//!   agent picked by an [`application::AgentSelector`], retrying failures with
//!   the previous failure injected into the next attempt's input.
//! - **Discussion**: tasks flagged `requires_collaboration` only run once a
//!   reviewer agent approves the assigned agent's plan. Discussions that never
//!   reach approval are escalated.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
