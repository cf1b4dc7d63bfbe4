//! Input/output DTOs and schema-bearing types
//!
//! Defines the normalized records produced by the codec, the argument types
//! of every catalog operation (annotated with `JsonSchema` so the interpreter
//! and MCP clients receive the same schemas), and the uniform
//! `OperationResult` shape.

use std::collections::BTreeSet;

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AppError;
use crate::query::Category;

/// Sentinel used when a message has no `Subject` header
pub const NO_SUBJECT: &str = "No Subject";
/// Sentinel used when a message has no `From` header
pub const UNKNOWN_SENDER: &str = "Unknown Sender";

/// Metadata included in MCP tool responses
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for MCP tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Canonical in-memory representation of a provider message
///
/// `subject` and `from` are never empty; absent headers are replaced with
/// [`NO_SUBJECT`] and [`UNKNOWN_SENDER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NormalizedMessage {
    /// Provider message id
    pub id: String,
    /// Provider thread id, when reported
    pub thread_id: Option<String>,
    /// Subject header or sentinel
    pub subject: String,
    /// From header or sentinel
    pub from: String,
    /// To header
    pub to: Option<String>,
    /// Date header, normalized to RFC 3339 when parseable
    pub date: Option<String>,
    /// Provider-generated preview text
    pub snippet: String,
    /// Decoded `text/html` body
    pub html_body: Option<String>,
    /// Decoded `text/plain` body
    pub plain_text_body: Option<String>,
    /// Provider label ids (e.g. `INBOX`, `UNREAD`, `STARRED`)
    pub labels: BTreeSet<String>,
    /// RFC 822 `Message-ID` header, used for reply threading headers
    pub message_id_header: Option<String>,
}

impl NormalizedMessage {
    /// Best-effort readable body: plain text, then rendered HTML, then snippet
    pub fn body_text(&self) -> String {
        if let Some(text) = self.plain_text_body.as_deref().filter(|t| !t.trim().is_empty()) {
            return text.to_owned();
        }
        if let Some(html) = self.html_body.as_deref().filter(|h| !h.trim().is_empty()) {
            return html2text::from_read(html.as_bytes(), 100)
                .map(|text| text.trim().to_owned())
                .unwrap_or_else(|_| html.to_owned());
        }
        self.snippet.clone()
    }
}

/// Lightweight listing entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageSummary {
    /// Provider message id
    pub id: String,
    /// Subject header or sentinel
    pub subject: String,
    /// From header or sentinel
    pub from: String,
    /// Date header, normalized when parseable
    pub date: Option<String>,
    /// Provider-generated preview text
    pub snippet: String,
    /// `false` while the message carries the `UNREAD` label
    pub is_read: bool,
    /// `true` while the message carries the `STARRED` label
    pub is_starred: bool,
}

impl From<&NormalizedMessage> for MessageSummary {
    fn from(message: &NormalizedMessage) -> Self {
        Self {
            id: message.id.clone(),
            subject: message.subject.clone(),
            from: message.from.clone(),
            date: message.date.clone(),
            snippet: message.snippet.clone(),
            is_read: !message.labels.contains("UNREAD"),
            is_starred: message.labels.contains("STARRED"),
        }
    }
}

/// Page of listing entries with provider continuation token
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessagePage {
    /// Up to `page_size` summaries, newest first as ordered by the provider
    pub messages: Vec<MessageSummary>,
    /// Token for the next page, `null` when there is none
    pub next_page_token: Option<String>,
}

/// Input: list a semantic category with optional free-text hints
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ListMessagesInput {
    /// Mailbox category (defaults to `inbox`)
    #[serde(default)]
    pub category: Category,
    /// Free-text hints: addresses, YYYY-MM-DD dates, `.ext` file types, sizes like `5mb`, or words
    pub query: Option<String>,
    /// Maximum messages to return (default 10)
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 1-based page number; `page_token` is only used when this is greater than 1
    #[serde(default = "default_page")]
    pub page: u32,
    /// Continuation token from a previous page
    pub page_token: Option<String>,
}

/// Input: search with an already-formed provider query
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SearchMessagesInput {
    /// Provider search query (e.g. `from:bob@example.com is:unread`)
    pub query: String,
    /// Maximum messages to return (default 10)
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 1-based page number; `page_token` is only used when this is greater than 1
    #[serde(default = "default_page")]
    pub page: u32,
    /// Continuation token from a previous page
    pub page_token: Option<String>,
}

/// Input: any single-message operation
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct MessageIdInput {
    /// Provider message id
    pub id: String,
}

/// Input: compose and send a new message
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SendMessageInput {
    /// Recipient address
    pub to: String,
    /// Subject line
    #[serde(default)]
    pub subject: String,
    /// Message body (HTML allowed)
    #[serde(default)]
    pub body: String,
    /// Thread to continue, if any
    pub thread_id: Option<String>,
}

/// Input: reply to the sender of an existing message
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ReplyInput {
    /// Provider id of the message being answered
    pub id: String,
    /// Reply body
    #[serde(default)]
    pub body: String,
}

/// Input: forward an existing message to a new recipient
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ForwardInput {
    /// Provider id of the message being forwarded
    pub id: String,
    /// Recipient address
    pub to: String,
    /// Comment placed above the forwarded content
    #[serde(default)]
    pub comment: String,
}

/// Error detail carried by a failed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorDetail {
    /// Stable error code (e.g. `invalid_argument`, `provider_error`)
    pub code: String,
    /// Diagnostic message
    pub message: String,
    /// Plain-language explanation suitable for end users
    pub explanation: String,
}

/// Success payload or error detail
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// Operation completed; payload shape depends on the operation
    Success { payload: Value },
    /// Operation failed before or at the provider
    Failure { error: ErrorDetail },
}

/// Uniform result of every catalog operation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OperationResult {
    /// Operation name as dispatched
    pub operation: String,
    /// 200 on success, otherwise the preserved error status
    pub status_code: u16,
    /// Short readable summary fed back to the interpreter
    pub summary: String,
    /// Payload or error detail
    #[serde(flatten)]
    pub outcome: OperationOutcome,
}

impl OperationResult {
    /// Successful result with status 200
    pub fn success(operation: impl Into<String>, summary: String, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            status_code: 200,
            summary,
            outcome: OperationOutcome::Success { payload },
        }
    }

    /// Failed result preserving the error's status code
    pub fn failure(operation: impl Into<String>, error: &AppError) -> Self {
        Self {
            operation: operation.into(),
            status_code: error.status_code(),
            summary: error.plain_language(),
            outcome: OperationOutcome::Failure {
                error: ErrorDetail {
                    code: error.code().to_owned(),
                    message: error.to_string(),
                    explanation: error.plain_language(),
                },
            },
        }
    }

    /// Whether the operation succeeded
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, OperationOutcome::Success { .. })
    }

    /// Success payload, if any
    pub fn payload(&self) -> Option<&Value> {
        match &self.outcome {
            OperationOutcome::Success { payload } => Some(payload),
            OperationOutcome::Failure { .. } => None,
        }
    }

    /// Error detail, if any
    pub fn error(&self) -> Option<&ErrorDetail> {
        match &self.outcome {
            OperationOutcome::Success { .. } => None,
            OperationOutcome::Failure { error } => Some(error),
        }
    }
}

/// Default value for `page_size`
///
/// Matches what a conversational summary can reasonably present.
fn default_page_size() -> usize {
    10
}

/// Default value for `page`
fn default_page() -> u32 {
    1
}
