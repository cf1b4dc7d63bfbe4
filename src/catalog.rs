//! Operation catalog
//!
//! Registry of named mailbox operations. Each descriptor carries its argument
//! schema (published to the interpreter and MCP clients) and a handler bound
//! to an [`OperationContext`]. Dispatch never returns `Err`: every outcome,
//! including provider rejections, is folded into an [`OperationResult`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt, stream};
use schemars::{JsonSchema, schema_for};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::gmail::{MailProvider, MessageFormat, ProviderResponse};
use crate::identity::AccountCredential;
use crate::mime::{self, BodyFormat, GmailMessage, OutgoingMessage};
use crate::models::{
    ForwardInput, ListMessagesInput, MessageIdInput, MessagePage, MessageSummary,
    NormalizedMessage, OperationResult, ReplyInput, SearchMessagesInput, SendMessageInput,
    UNKNOWN_SENDER,
};
use crate::query::CategoryQuery;

/// Concurrent `messages.get` calls while expanding a listing
const LIST_FETCH_CONCURRENCY: usize = 8;
/// Body characters shown per message in a listing summary
const LIST_BODY_PREVIEW_CHARS: usize = 200;
/// Body characters shown in a single-message summary
const GET_BODY_PREVIEW_CHARS: usize = 4_000;
/// Upper bound for message id length
const MAX_ID_LEN: usize = 256;

/// Everything a handler needs for one call
///
/// Built per turn (or per direct call) from a freshly resolved credential.
#[derive(Clone)]
pub struct OperationContext {
    pub provider: Arc<dyn MailProvider>,
    pub credential: AccountCredential,
    pub config: Arc<ServerConfig>,
}

/// Named operation call with JSON arguments
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct OperationRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl OperationRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

type Handled = (String, Value);
type HandlerFuture<'a> = BoxFuture<'a, AppResult<Handled>>;
type Handler = for<'a> fn(&'a OperationContext, Value) -> HandlerFuture<'a>;

/// Registry entry: name, schema, handler
#[derive(Clone, Copy)]
pub struct OperationDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    /// Mutating operations are gated by `write_enabled` and serialized
    /// within an orchestration step
    pub mutating: bool,
    schema: fn() -> Value,
    handler: Handler,
}

impl OperationDescriptor {
    /// JSON schema of the operation's arguments
    pub fn input_schema(&self) -> Value {
        (self.schema)()
    }
}

/// Operation registry keyed by name
#[derive(Clone)]
pub struct Catalog {
    operations: BTreeMap<&'static str, OperationDescriptor>,
}

impl Catalog {
    /// Catalog with every supported mailbox operation
    pub fn standard() -> Self {
        let entries = [
            descriptor::<ListMessagesInput>(
                "list_messages",
                "List messages in a mailbox category (inbox, starred, sent, drafts, trash), optionally narrowed by free-text hints such as addresses, dates, file types or sizes",
                false,
                list_messages,
            ),
            descriptor::<SearchMessagesInput>(
                "search_messages",
                "Search messages with a provider query string such as 'from:bob@example.com is:unread'",
                false,
                search_messages,
            ),
            descriptor::<MessageIdInput>(
                "get_message",
                "Get one message with headers and full body",
                false,
                get_message,
            ),
            descriptor::<MessageIdInput>(
                "get_labels",
                "Get the label ids attached to one message",
                false,
                get_labels,
            ),
            descriptor::<SendMessageInput>(
                "send_message",
                "Compose and send a new message",
                true,
                send_message,
            ),
            descriptor::<ReplyInput>(
                "reply_to_message",
                "Reply to the sender of a message in the same thread",
                true,
                reply_to_message,
            ),
            descriptor::<ForwardInput>(
                "forward_message",
                "Forward a message to a new recipient with an optional comment",
                true,
                forward_message,
            ),
            descriptor::<MessageIdInput>("star_message", "Star a message", true, star_message),
            descriptor::<MessageIdInput>(
                "unstar_message",
                "Remove the star from a message",
                true,
                unstar_message,
            ),
            descriptor::<MessageIdInput>("mark_read", "Mark a message as read", true, mark_read),
            descriptor::<MessageIdInput>(
                "mark_unread",
                "Mark a message as unread",
                true,
                mark_unread,
            ),
            descriptor::<MessageIdInput>(
                "trash_message",
                "Move a message to the trash (reversible)",
                true,
                trash_message,
            ),
            descriptor::<MessageIdInput>(
                "untrash_message",
                "Restore a message from the trash",
                true,
                untrash_message,
            ),
            descriptor::<MessageIdInput>(
                "delete_message",
                "Permanently delete a message (cannot be undone)",
                true,
                delete_message,
            ),
        ];
        Self {
            operations: entries.into_iter().map(|d| (d.name, d)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.get(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.operations.values()
    }

    /// Whether a requested operation mutates mailbox state
    ///
    /// Unknown names count as reads; they fail at dispatch without touching
    /// the provider.
    pub fn is_mutating(&self, name: &str) -> bool {
        self.get(name).is_some_and(|d| d.mutating)
    }

    /// Validate, execute, and wrap one operation call
    pub async fn dispatch(
        &self,
        ctx: &OperationContext,
        request: &OperationRequest,
    ) -> OperationResult {
        let started = Instant::now();
        let result = match self.get(&request.name) {
            Some(descriptor) => run(descriptor, ctx, request.arguments.clone()).await,
            None => Err(AppError::invalid(format!(
                "unknown operation '{}'",
                request.name
            ))),
        };

        let result = match result {
            Ok((summary, payload)) => OperationResult::success(&request.name, summary, payload),
            Err(e) => OperationResult::failure(&request.name, &e),
        };
        tracing::info!(
            account_id = %ctx.credential.account_id,
            operation = %request.name,
            status = result.status_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "operation dispatched"
        );
        result
    }
}

async fn run(
    descriptor: &OperationDescriptor,
    ctx: &OperationContext,
    arguments: Value,
) -> AppResult<Handled> {
    if descriptor.mutating {
        require_write_enabled(&ctx.config)?;
    }
    (descriptor.handler)(ctx, arguments).await
}

fn descriptor<T: JsonSchema>(
    name: &'static str,
    description: &'static str,
    mutating: bool,
    handler: Handler,
) -> OperationDescriptor {
    OperationDescriptor {
        name,
        description,
        mutating,
        schema: schema_of::<T>,
        handler,
    }
}

fn schema_of<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schema_for!(T)).unwrap_or_default();
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
    }
    schema
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> AppResult<T> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|e| AppError::invalid(format!("malformed arguments: {e}")))
}

fn to_payload<T: Serialize>(value: &T) -> AppResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| AppError::Internal(format!("failed to serialize payload: {e}")))
}

fn list_messages(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(async move {
        let input: ListMessagesInput = parse_args(arguments)?;
        if let Some(text) = &input.query {
            validate_query_text(text)?;
        }
        let query = CategoryQuery::for_category(
            input.category,
            input.query.as_deref(),
            input.page_size,
            ctx.config.max_page_size,
            input.page,
            input.page_token.as_deref(),
        );
        list_page(ctx, &query).await
    })
}

fn search_messages(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(async move {
        let input: SearchMessagesInput = parse_args(arguments)?;
        if input.query.trim().is_empty() {
            return Err(AppError::invalid("query must not be empty"));
        }
        validate_query_text(&input.query)?;
        let query = CategoryQuery::raw(
            input.query.trim().to_owned(),
            input.page_size,
            ctx.config.max_page_size,
            input.page,
            input.page_token.as_deref(),
        );
        list_page(ctx, &query).await
    })
}

/// Run `messages.list`, then expand each id with a full fetch
async fn list_page(ctx: &OperationContext, query: &CategoryQuery) -> AppResult<Handled> {
    let body = ctx.provider.list_messages(query).await?.into_result()?;
    let ids = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|m| m.get("id").and_then(Value::as_str))
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let next_page_token = body
        .get("nextPageToken")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let messages = stream::iter(ids)
        .map(|id| async move { fetch_message(ctx, &id, MessageFormat::Full).await })
        .buffered(LIST_FETCH_CONCURRENCY)
        .try_collect::<Vec<_>>()
        .await?;

    let summary = if messages.is_empty() {
        "No messages found.".to_owned()
    } else {
        messages
            .iter()
            .map(|m| message_block(m, LIST_BODY_PREVIEW_CHARS))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    let page = MessagePage {
        messages: messages.iter().map(MessageSummary::from).collect(),
        next_page_token,
    };
    Ok((summary, to_payload(&page)?))
}

/// Readable block for one message, body truncated with an ellipsis
fn message_block(message: &NormalizedMessage, max_body_chars: usize) -> String {
    let body = message.body_text();
    let preview = if body.chars().count() > max_body_chars {
        format!("{}...", mime::truncate_chars(&body, max_body_chars))
    } else {
        body
    };
    format!(
        "### 📧 Email from {}\n**Id:** {}\n**Subject:** {}\n\n**Summary:**\n{preview}\n\n---",
        message.from, message.id, message.subject
    )
}

/// `messages.get` + decode; 404 becomes `NotFound`
async fn fetch_message(
    ctx: &OperationContext,
    id: &str,
    format: MessageFormat,
) -> AppResult<NormalizedMessage> {
    let response = ctx.provider.get_message(id, format).await?;
    let body = single_target(response, id)?;
    let message: GmailMessage = serde_json::from_value(body)
        .map_err(|e| AppError::Internal(format!("malformed provider message: {e}")))?;
    mime::decode_message(&message)
}

fn single_target(response: ProviderResponse, id: &str) -> AppResult<Value> {
    if response.status == 404 {
        return Err(AppError::NotFound(format!("message '{id}'")));
    }
    response.into_result()
}

fn get_message(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(async move {
        let input: MessageIdInput = parse_args(arguments)?;
        validate_id(&input.id)?;
        let message = fetch_message(ctx, &input.id, MessageFormat::Full).await?;
        let mut summary = message_block(&message, GET_BODY_PREVIEW_CHARS);
        if let Some(date) = &message.date {
            summary.push_str(&format!("\n**Date:** {date}"));
        }
        Ok((summary, to_payload(&message)?))
    })
}

fn get_labels(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(async move {
        let input: MessageIdInput = parse_args(arguments)?;
        validate_id(&input.id)?;
        let message = fetch_message(ctx, &input.id, MessageFormat::Metadata).await?;
        let labels = message.labels.into_iter().collect::<Vec<_>>();
        let summary = format!("Message {} labels: {}", input.id, labels.join(", "));
        Ok((summary, json!({ "id": input.id, "labels": labels })))
    })
}

fn send_message(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(async move {
        let input: SendMessageInput = parse_args(arguments)?;
        validate_address(&input.to, "to")?;
        validate_no_controls(&input.subject, "subject")?;
        if let Some(thread_id) = &input.thread_id {
            validate_id(thread_id)?;
        }
        let outgoing = OutgoingMessage {
            from: Some(ctx.credential.email.clone()),
            to: input.to.trim().to_owned(),
            subject: input.subject,
            body: input.body,
            in_reply_to: None,
            format: BodyFormat::Html,
        };
        transmit(ctx, &outgoing, input.thread_id.as_deref()).await
    })
}

/// Reply to the original sender's bare address
///
/// The reply is sent in the original message's thread (`threadId`), falling
/// back to the original message id when the provider omits a thread.
fn reply_to_message(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(async move {
        let input: ReplyInput = parse_args(arguments)?;
        validate_id(&input.id)?;
        let original = fetch_message(ctx, &input.id, MessageFormat::Metadata).await?;
        if original.from == UNKNOWN_SENDER {
            return Err(AppError::invalid("original message has no sender to reply to"));
        }
        let to = mime::extract_address(&original.from);
        validate_address(&to, "reply address")?;

        let outgoing = OutgoingMessage {
            from: Some(ctx.credential.email.clone()),
            to,
            subject: mime::reply_subject(&original.subject),
            body: input.body,
            in_reply_to: original.message_id_header.clone(),
            format: BodyFormat::Html,
        };
        let thread_id = original.thread_id.as_deref().unwrap_or(&input.id);
        transmit(ctx, &outgoing, Some(thread_id)).await
    })
}

fn forward_message(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(async move {
        let input: ForwardInput = parse_args(arguments)?;
        validate_id(&input.id)?;
        validate_address(&input.to, "to")?;
        let original = fetch_message(ctx, &input.id, MessageFormat::Full).await?;

        let outgoing = OutgoingMessage {
            from: Some(ctx.credential.email.clone()),
            to: input.to.trim().to_owned(),
            subject: mime::forward_subject(&original.subject),
            body: mime::forward_body(&input.comment, &original),
            in_reply_to: None,
            format: BodyFormat::Html,
        };
        transmit(ctx, &outgoing, None).await
    })
}

/// Encode and send; payload is the provider-assigned id
async fn transmit(
    ctx: &OperationContext,
    outgoing: &OutgoingMessage,
    thread_id: Option<&str>,
) -> AppResult<Handled> {
    let raw = mime::encode_message(outgoing);
    let body = ctx.provider.send_raw(&raw, thread_id).await?.into_result()?;
    let id = body.get("id").and_then(Value::as_str).unwrap_or_default();
    let thread = body.get("threadId").and_then(Value::as_str);
    Ok((
        format!(
            "Message '{}' sent to {} (id {id}).",
            outgoing.subject, outgoing.to
        ),
        json!({ "id": id, "thread_id": thread }),
    ))
}

/// Label change on one message; exactly one of `add`/`remove` is non-empty
async fn modify_labels(
    ctx: &OperationContext,
    arguments: Value,
    add: &[&str],
    remove: &[&str],
    done: &str,
) -> AppResult<Handled> {
    let input: MessageIdInput = parse_args(arguments)?;
    validate_id(&input.id)?;
    let response = ctx.provider.modify_labels(&input.id, add, remove).await?;
    let body = single_target(response, &input.id)?;
    let labels = body.get("labelIds").cloned().unwrap_or_else(|| json!([]));
    Ok((
        format!("Message {} {done}.", input.id),
        json!({ "id": input.id, "labels": labels }),
    ))
}

fn star_message(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(modify_labels(ctx, arguments, &["STARRED"], &[], "starred"))
}

fn unstar_message(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(modify_labels(ctx, arguments, &[], &["STARRED"], "unstarred"))
}

fn mark_read(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(modify_labels(ctx, arguments, &[], &["UNREAD"], "marked as read"))
}

fn mark_unread(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(modify_labels(ctx, arguments, &["UNREAD"], &[], "marked as unread"))
}

#[derive(Clone, Copy)]
enum Removal {
    Trash,
    Untrash,
    Delete,
}

async fn remove_message(
    ctx: &OperationContext,
    arguments: Value,
    kind: Removal,
) -> AppResult<Handled> {
    let input: MessageIdInput = parse_args(arguments)?;
    validate_id(&input.id)?;
    let (response, done) = match kind {
        Removal::Trash => (ctx.provider.trash_message(&input.id).await?, "moved to trash"),
        Removal::Untrash => (ctx.provider.untrash_message(&input.id).await?, "restored from trash"),
        Removal::Delete => (ctx.provider.delete_message(&input.id).await?, "permanently deleted"),
    };
    single_target(response, &input.id)?;
    Ok((
        format!("Message {} {done}.", input.id),
        json!({ "id": input.id }),
    ))
}

fn trash_message(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(remove_message(ctx, arguments, Removal::Trash))
}

fn untrash_message(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(remove_message(ctx, arguments, Removal::Untrash))
}

fn delete_message(ctx: &OperationContext, arguments: Value) -> HandlerFuture<'_> {
    Box::pin(remove_message(ctx, arguments, Removal::Delete))
}

fn require_write_enabled(config: &ServerConfig) -> AppResult<()> {
    if !config.write_enabled {
        return Err(AppError::invalid(
            "write operations are disabled; set MAIL_GATEWAY_WRITE_ENABLED=true",
        ));
    }
    Ok(())
}

fn validate_id(id: &str) -> AppResult<()> {
    if id.trim().is_empty() || id.len() > MAX_ID_LEN {
        return Err(AppError::invalid(format!(
            "id must be 1..{MAX_ID_LEN} characters"
        )));
    }
    validate_no_controls(id, "id")
}

fn validate_address(value: &str, field: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::invalid(format!("{field} must not be empty")));
    }
    validate_no_controls(value, field)
}

/// Query text travels as a URL parameter; whitespace of any kind separates terms
fn validate_query_text(value: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_control() && !ch.is_whitespace()) {
        return Err(AppError::invalid(
            "query must not contain non-whitespace control characters",
        ));
    }
    Ok(())
}

/// Reject control characters that could inject extra header lines
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::invalid(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}
