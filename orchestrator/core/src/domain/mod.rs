// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Aggregates, value objects, governors and the ports (repository, model
//! provider, tool server) the application layer is written against.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and policies; no I/O

pub mod agent;
pub mod concurrency;
pub mod config;
pub mod events;
pub mod governor;
pub mod llm;
pub mod repository;
pub mod run;
pub mod tool;
pub mod tool_resolution;
