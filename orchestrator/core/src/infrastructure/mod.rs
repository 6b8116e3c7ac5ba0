// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod db;
pub mod event_bus;
pub mod llm;
pub mod repositories;
pub mod telemetry;
pub mod tool_server;

pub use event_bus::{DomainEvent, EventBus};
pub use tool_server::StdioToolServerConnector;
