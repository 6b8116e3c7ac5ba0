// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Tracing subscriber setup for binaries and embedders.
//
// RUST_LOG wins over the level passed in. SWITCHYARD_LOG_FORMAT=json switches
// to one JSON object per line.

use anyhow::{Context, Result};

pub const LOG_FORMAT_ENV: &str = "SWITCHYARD_LOG_FORMAT";

pub fn init_tracing(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}
