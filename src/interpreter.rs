//! Interpreter collaborator
//!
//! The language model sits behind [`Interpreter`]: given the system preamble,
//! the conversation so far, and the catalog's operation descriptions, it
//! answers with free text, operation calls, or both. The shipped
//! implementation speaks the OpenAI-compatible chat completions protocol.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::timeout;

use crate::catalog::Catalog;
use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One conversation entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Operation calls requested by an assistant entry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Call this `tool` entry answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    #[cfg(test)]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    fn to_wire(&self) -> Value {
        match self.role {
            Role::Assistant if !self.tool_calls.is_empty() => json!({
                "role": "assistant",
                "content": self.content,
                "tool_calls": self.tool_calls.iter().map(|call| json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    },
                })).collect::<Vec<_>>(),
            }),
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": self.tool_call_id,
                "content": self.content,
            }),
            role => json!({ "role": role, "content": self.content }),
        }
    }
}

/// Operation call requested by the interpreter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Argument mapping; kept as a string when the model emitted invalid JSON
    pub arguments: Value,
}

/// Operation description offered to the interpreter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    /// One spec per catalog operation
    pub fn from_catalog(catalog: &Catalog) -> Vec<Self> {
        catalog
            .descriptors()
            .map(|d| Self {
                name: d.name.to_owned(),
                description: d.description.to_owned(),
                parameters: d.input_schema(),
            })
            .collect()
    }
}

/// Everything the interpreter sees on one model turn
#[derive(Debug, Clone)]
pub struct InterpreterRequest {
    pub system_preamble: String,
    pub history: Vec<ChatMessage>,
    pub operations: Vec<ToolSpec>,
}

/// Free text and zero or more operation calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterpreterReply {
    pub text: String,
    pub calls: Vec<ToolCall>,
}

#[async_trait]
pub trait Interpreter: Send + Sync {
    /// # Errors
    ///
    /// - `Interpreter` when the model cannot be reached or answers garbage
    async fn next_turn(&self, request: &InterpreterRequest) -> AppResult<InterpreterReply>;
}

/// OpenAI-compatible `/chat/completions` client
pub struct ChatCompletionsInterpreter {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl ChatCompletionsInterpreter {
    pub fn new(http: reqwest::Client, config: &ServerConfig) -> Self {
        Self {
            http,
            endpoint: format!("{}/chat/completions", config.llm_base_url),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            request_timeout: Duration::from_millis(config.llm_timeout_ms),
        }
    }

    fn request_body(&self, request: &InterpreterRequest) -> Value {
        let mut messages = Vec::with_capacity(request.history.len() + 1);
        messages.push(json!({ "role": "system", "content": request.system_preamble }));
        messages.extend(request.history.iter().map(ChatMessage::to_wire));

        let tools = request
            .operations
            .iter()
            .map(|op| {
                json!({
                    "type": "function",
                    "function": {
                        "name": op.name,
                        "description": op.description,
                        "parameters": op.parameters,
                    },
                })
            })
            .collect::<Vec<_>>();

        json!({
            "model": self.model,
            "messages": messages,
            "tools": tools,
            "tool_choice": "auto",
        })
    }
}

#[async_trait]
impl Interpreter for ChatCompletionsInterpreter {
    async fn next_turn(&self, request: &InterpreterRequest) -> AppResult<InterpreterReply> {
        let started = Instant::now();
        let mut builder = self.http.post(&self.endpoint).json(&self.request_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = timeout(self.request_timeout, builder.send())
            .await
            .map_err(|_| AppError::Interpreter("model request timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Interpreter(format!("model request failed: {e}"))))?;
        let status = response.status();
        if !status.is_success() {
            let body = timeout(self.request_timeout, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            return Err(AppError::Interpreter(format!(
                "model returned status {}: {}",
                status.as_u16(),
                crate::mime::truncate_chars(&body, 300)
            )));
        }

        let completion = timeout(self.request_timeout, response.json::<CompletionResponse>())
            .await
            .map_err(|_| AppError::Interpreter("model response timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Interpreter(format!("malformed model response: {e}"))))?;
        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| AppError::Interpreter("model returned no choices".to_owned()))?;

        let calls = message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| ToolCall {
                id: if call.id.is_empty() {
                    format!("call_{index}")
                } else {
                    call.id
                },
                name: call.function.name,
                arguments: parse_arguments(&call.function.arguments),
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            calls = calls.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "interpreter turn"
        );
        Ok(InterpreterReply {
            text: message.content.unwrap_or_default(),
            calls,
        })
    }
}

/// Parse the model's argument string
///
/// Blank means no arguments. Invalid JSON is kept verbatim as a string so
/// dispatch rejects it as malformed.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}
