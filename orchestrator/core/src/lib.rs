// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Switchyard Core
//!
//! Runs tool-calling agents under step, time and repetition governors, lets
//! them delegate to each other in bounded trees, and records every message
//! and tool call for inspection and resume.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Agent execution engine shared by the dispatcher crate

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
