// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// OpenAI Model Provider Adapter
//
// Anti-Corruption Layer for the chat completions API with tool calling.
// Also works with OpenAI-compatible APIs (LM Studio, vLLM, etc.)

use crate::domain::config::{resolve_env_value, ConfigError, ModelProviderConfig};
use crate::domain::llm::{FinishReason, LLMError, ModelProvider, ModelResponse, TokenUsage};
use crate::domain::run::{ConversationMessage, MessageRole, ToolCallRequest};
use crate::domain::tool::ToolDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub struct OpenAIAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAITool<'a>>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct OpenAIMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: OpenAIFunctionCall,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct OpenAIFunctionCall {
    name: String,
    /// JSON-encoded argument object
    arguments: String,
}

#[derive(Serialize)]
struct OpenAITool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAIFunction<'a>,
}

#[derive(Serialize)]
struct OpenAIFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

fn function_type() -> String {
    "function".to_string()
}

impl OpenAIAdapter {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }

    pub fn from_config(config: &ModelProviderConfig) -> Result<Self, ConfigError> {
        let api_key = match &config.api_key {
            Some(key) => resolve_env_value(key)?,
            // Local providers without auth
            None => String::new(),
        };
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
        })
    }
}

fn to_openai_message(message: &ConversationMessage) -> OpenAIMessage {
    let content = &message.content;
    match message.role {
        MessageRole::System | MessageRole::User => OpenAIMessage {
            role: message.role.as_str().to_string(),
            content: content.text.clone(),
            tool_calls: None,
            tool_call_id: None,
        },
        MessageRole::Assistant => OpenAIMessage {
            role: "assistant".to_string(),
            content: content.text.clone(),
            tool_calls: (!content.tool_calls.is_empty()).then(|| {
                content
                    .tool_calls
                    .iter()
                    .map(|call| OpenAIToolCall {
                        id: call.id.clone(),
                        kind: function_type(),
                        function: OpenAIFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: None,
        },
        MessageRole::ToolResult => OpenAIMessage {
            role: "tool".to_string(),
            content: content.text.clone(),
            tool_calls: None,
            tool_call_id: content.tool_call_id.clone(),
        },
    }
}

fn from_openai_tool_call(call: OpenAIToolCall) -> ToolCallRequest {
    // Malformed argument JSON is passed through as a string
    let arguments = serde_json::from_str(&call.function.arguments)
        .unwrap_or(Value::String(call.function.arguments));
    ToolCallRequest {
        id: call.id,
        name: call.function.name,
        arguments,
    }
}

#[async_trait]
impl ModelProvider for OpenAIAdapter {
    async fn invoke(
        &self,
        model: &str,
        system_prompt: &str,
        history: &[ConversationMessage],
        tools: &[ToolDescriptor],
    ) -> Result<ModelResponse, LLMError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(OpenAIMessage {
            role: "system".to_string(),
            content: Some(system_prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });
        messages.extend(history.iter().map(to_openai_message));

        let request = OpenAIRequest {
            model,
            messages,
            tools: tools
                .iter()
                .map(|tool| OpenAITool {
                    kind: "function",
                    function: OpenAIFunction {
                        name: &tool.name,
                        description: &tool.description,
                        parameters: &tool.input_schema,
                    },
                })
                .collect(),
        };

        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            return Err(if status == 401 || status == 403 {
                LLMError::Authentication(error_text)
            } else if status == 429 {
                LLMError::RateLimit
            } else if status == 404 {
                LLMError::ModelNotFound(model.to_string())
            } else {
                LLMError::Provider(format!("HTTP {}: {}", status, error_text))
            });
        }

        let openai_response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Provider(format!("Failed to parse response: {}", e)))?;

        let usage = openai_response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        let choice = openai_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::Provider("No response from model".into()))?;

        Ok(ModelResponse {
            text: choice.message.content.filter(|t| !t.is_empty()),
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(from_openai_tool_call)
                .collect(),
            usage,
            finish_reason: match choice.finish_reason.as_deref() {
                Some("tool_calls") => FinishReason::ToolCalls,
                Some("length") => FinishReason::Length,
                Some("content_filter") => FinishReason::ContentFilter,
                _ => FinishReason::Stop,
            },
        })
    }
}
