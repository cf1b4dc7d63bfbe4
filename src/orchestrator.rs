//! Bounded tool-orchestration loop
//!
//! One user turn alternates between asking the interpreter for its next move
//! and executing the operations it requests, until the interpreter answers
//! without calls or the step bound is reached. One step is one interpreter
//! round trip; the calls requested on a step are executed before the loop
//! either continues or stops.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, OperationContext, OperationRequest};
use crate::errors::{AppError, AppResult};
use crate::gateway::Gateway;
use crate::identity::Session;
use crate::interpreter::{ChatMessage, Interpreter, InterpreterRequest, ToolCall, ToolSpec};
use crate::models::OperationResult;
use crate::query::Category;

/// Record of one operation executed during a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokedOperation {
    pub name: String,
    pub arguments: Value,
    pub succeeded: bool,
    pub status_code: u16,
}

/// Result of `handle_turn`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    /// Answer shown to the user
    pub final_text: String,
    /// Operations in execution-request order
    pub operations_invoked: Vec<InvokedOperation>,
    /// Interpreter round trips used
    pub steps: usize,
    /// 200, or the status of the first failed operation
    pub status_code: u16,
}

pub struct Orchestrator {
    gateway: Arc<Gateway>,
    interpreter: Arc<dyn Interpreter>,
}

impl Orchestrator {
    pub fn new(gateway: Arc<Gateway>, interpreter: Arc<dyn Interpreter>) -> Self {
        Self {
            gateway,
            interpreter,
        }
    }

    /// Run one user turn to completion
    ///
    /// # Errors
    ///
    /// - credential errors abort before any interpreter or provider call
    /// - `Interpreter` if the model fails on any step
    /// - `Cancelled` if `cancel` fires; in-flight calls are abandoned
    pub async fn handle_turn(
        &self,
        session: &Session,
        history: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> AppResult<TurnOutcome> {
        let started = Instant::now();
        let ctx = self.gateway.open_context(session).await?;
        let catalog = self.gateway.catalog();
        let max_steps = self.gateway.config().max_steps;

        let mut request = InterpreterRequest {
            system_preamble: system_preamble(
                &ctx.credential.email,
                self.gateway.config().max_page_size,
            ),
            history,
            operations: ToolSpec::from_catalog(catalog),
        };
        let mut invoked = Vec::new();
        let mut first_failure = None;
        let mut final_text = String::new();
        let mut steps = 0;

        while steps < max_steps {
            steps += 1;
            let reply = tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                reply = self.interpreter.next_turn(&request) => reply?,
            };
            if reply.calls.is_empty() {
                final_text = reply.text;
                break;
            }

            let results = tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                results = execute_step(catalog, &ctx, &reply.calls) => results,
            };

            request
                .history
                .push(ChatMessage::assistant_calls(reply.text.clone(), reply.calls.clone()));
            for (call, result) in reply.calls.iter().zip(&results) {
                request
                    .history
                    .push(ChatMessage::tool_result(call.id.clone(), tool_content(result)));
                if !result.succeeded() && first_failure.is_none() {
                    first_failure = Some(result.status_code);
                }
                invoked.push(InvokedOperation {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    succeeded: result.succeeded(),
                    status_code: result.status_code,
                });
            }

            if steps == max_steps {
                tracing::info!(
                    account_id = %ctx.credential.account_id,
                    step = steps,
                    "step bound reached with operations still requested"
                );
                final_text = if reply.text.trim().is_empty() {
                    compose_from_results(&results)
                } else {
                    reply.text
                };
            }
        }

        let outcome = TurnOutcome {
            final_text,
            operations_invoked: invoked,
            steps,
            status_code: first_failure.unwrap_or(200),
        };
        tracing::info!(
            account_id = %ctx.credential.account_id,
            steps = outcome.steps,
            operations = outcome.operations_invoked.len(),
            status = outcome.status_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn completed"
        );
        Ok(outcome)
    }
}

/// Execute one step's calls, reads concurrently then mutations in order
///
/// Results come back in the order the calls were requested.
async fn execute_step(
    catalog: &Catalog,
    ctx: &OperationContext,
    calls: &[ToolCall],
) -> Vec<OperationResult> {
    let requests = calls
        .iter()
        .map(|call| OperationRequest::new(call.name.clone(), call.arguments.clone()))
        .collect::<Vec<_>>();
    let (mutations, reads): (Vec<_>, Vec<_>) = requests
        .iter()
        .enumerate()
        .partition(|(_, r)| catalog.is_mutating(&r.name));

    let mut results: Vec<Option<OperationResult>> = vec![None; requests.len()];
    let read_results = join_all(reads.iter().map(|(_, r)| catalog.dispatch(ctx, r))).await;
    for ((index, _), result) in reads.iter().zip(read_results) {
        results[*index] = Some(result);
    }
    for (index, request) in mutations {
        results[index] = Some(catalog.dispatch(ctx, request).await);
    }

    results
        .into_iter()
        .zip(requests)
        .map(|(result, request)| {
            result.unwrap_or_else(|| {
                OperationResult::failure(
                    request.name,
                    &AppError::Internal("operation was not executed".to_owned()),
                )
            })
        })
        .collect()
}

/// Text returned to the interpreter for one call
fn tool_content(result: &OperationResult) -> String {
    match result.error() {
        None => result.summary.clone(),
        Some(error) => format!(
            "Operation {} failed ({}): {} Detail: {}",
            result.operation, error.code, error.explanation, error.message
        ),
    }
}

/// Fallback answer when the model stops without text
fn compose_from_results(results: &[OperationResult]) -> String {
    results
        .iter()
        .map(|r| r.summary.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// System preamble describing the assistant's role and conventions
pub fn system_preamble(identity: &str, max_page_size: usize) -> String {
    let categories = Category::ALL
        .iter()
        .map(|c| c.base_term())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You are an email assistant that helps the user manage their mailbox through natural language.\n\
         The user is signed in as: {identity}\n\
         \n\
         Use the provided operations to read, search, send, reply to, forward, star, unstar, mark read or unread, trash, restore and permanently delete messages, and to look up a message's labels. Always use real mailbox data from the operations; never invent messages.\n\
         \n\
         Conventions:\n\
         - Mailbox categories map to these provider terms: {categories}.\n\
         - list_messages accepts free-text hints: email addresses, YYYY-MM-DD dates (messages after that day), .ext file types, sizes like 5mb, or plain words.\n\
         - Page sizes above {max_page_size} are reduced to {max_page_size}.\n\
         - Message ids appear in listing results; use them for follow-up operations. Ask the user when an id is ambiguous.\n\
         - Before sending, make sure you know the recipient, subject and content. Ask for anything missing.\n\
         - Only call delete_message when the user clearly wants permanent deletion; prefer trash_message otherwise.\n\
         - When reading messages, summarize them instead of repeating them verbatim.\n\
         - Explain failures in plain language without quoting status codes.\n\
         \n\
         Always be helpful, concise, and respectful of the user's privacy."
    )
}
