// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Model Provider Domain Interface (Anti-Corruption Layer)
//
// The executor only ever sees this trait. Vendor APIs live behind adapters in
// infrastructure/llm/.

use crate::domain::run::{ConversationMessage, ToolCallRequest};
use crate::domain::tool::ToolDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Domain interface for tool-calling chat models
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run one model turn over `history`. An empty `tools` slice disables
    /// tool calling for the turn.
    async fn invoke(
        &self,
        model: &str,
        system_prompt: &str,
        history: &[ConversationMessage],
        tools: &[ToolDescriptor],
    ) -> Result<ModelResponse, LLMError>;
}

#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    /// Assistant text, if any
    pub text: Option<String>,

    /// Tool invocations requested this turn
    pub tool_calls: Vec<ToolCallRequest>,

    /// Token usage stats
    pub usage: TokenUsage,

    /// Why generation stopped
    pub finish_reason: FinishReason,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural completion (model decided to stop)
    #[default]
    Stop,

    /// Model requested tool calls
    ToolCalls,

    /// Hit max_tokens limit
    Length,

    /// Blocked by content filter
    ContentFilter,
}

/// Errors that can occur during model invocation
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
