// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Model Provider Infrastructure - Anti-Corruption Layer Implementations
//
// Each adapter translates between the ModelProvider port and a vendor API.

pub mod openai;

pub use openai::OpenAIAdapter;
