// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Dispatch Domain Layer
//!
//! Pure domain types for planned work. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`task`] | `SpecTask`, `TaskId`, `TaskStatus` |
//! | [`graph`] | `TaskGraphSpec`, `TaskSpec`, cycle detection |
//! | [`discussion`] | `Discussion`, `DiscussionEntry` |
//! | [`repository`] | `TaskRepository`, `DiscussionRepository` ports |

pub mod discussion;
pub mod graph;
pub mod repository;
pub mod task;

pub use discussion::*;
pub use graph::*;
pub use repository::*;
pub use task::*;
