//! In-memory collaborators for unit tests

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::SecretString;
use serde_json::{Value, json};

use crate::catalog::OperationContext;
use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::gateway::Gateway;
use crate::gmail::{MailProvider, MessageFormat, ProviderFactory, ProviderResponse};
use crate::identity::{AccountCredential, AccountRecord, AccountStore, TokenPair};
use crate::interpreter::{Interpreter, InterpreterReply, InterpreterRequest};
use crate::mime::{GmailMessage, MessageHeader, MessagePart, PartBody};
use crate::query::CategoryQuery;

pub struct MemoryAccountStore {
    accounts: Vec<(AccountRecord, TokenPair)>,
}

impl MemoryAccountStore {
    pub fn with_account(
        account_id: &str,
        email: &str,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Self {
        let secret = |v: Option<&str>| v.map(|v| SecretString::new(v.into()));
        Self {
            accounts: vec![(
                AccountRecord {
                    account_id: account_id.to_owned(),
                    email: email.to_owned(),
                },
                TokenPair {
                    access_token: secret(access_token),
                    refresh_token: secret(refresh_token),
                },
            )],
        }
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_account_by_identity(&self, identity: &str) -> AppResult<Option<AccountRecord>> {
        Ok(self
            .accounts
            .iter()
            .find(|(record, _)| record.email.eq_ignore_ascii_case(identity))
            .map(|(record, _)| record.clone()))
    }

    async fn get_token_pair(&self, account_id: &str) -> AppResult<TokenPair> {
        Ok(self
            .accounts
            .iter()
            .find(|(record, _)| record.account_id == account_id)
            .map(|(_, tokens)| tokens.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub raw: String,
    pub thread_id: Option<String>,
}

/// Provider stub holding messages and label state in memory
#[derive(Default)]
pub struct StubProvider {
    messages: Mutex<BTreeMap<String, GmailMessage>>,
    sent: Mutex<Vec<SentMessage>>,
    modify_calls: Mutex<Vec<(Vec<String>, Vec<String>)>>,
    last_query: Mutex<Option<String>>,
    calls: AtomicUsize,
    fail_status: Option<u16>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(self, message: GmailMessage) -> Self {
        self.messages
            .lock()
            .expect("lock")
            .insert(message.id.clone(), message);
        self
    }

    /// Every call answers with this status
    pub fn failing_with(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("lock").clone()
    }

    pub fn modify_calls(&self) -> Vec<(Vec<String>, Vec<String>)> {
        self.modify_calls.lock().expect("lock").clone()
    }

    pub fn last_query(&self) -> Option<String> {
        self.last_query.lock().expect("lock").clone()
    }

    pub fn has_message(&self, id: &str) -> bool {
        self.messages.lock().expect("lock").contains_key(id)
    }

    pub fn labels_of(&self, id: &str) -> BTreeSet<String> {
        self.messages
            .lock()
            .expect("lock")
            .get(id)
            .map(|m| m.label_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn enter(&self) -> Option<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fail_status.map(|status| ProviderResponse {
            status,
            body: json!({"error": {"message": "stub failure"}}),
        })
    }

    fn relabel(&self, id: &str, add: &[&str], remove: &[&str]) -> ProviderResponse {
        let mut messages = self.messages.lock().expect("lock");
        let Some(message) = messages.get_mut(id) else {
            return not_found();
        };
        message.label_ids.retain(|l| !remove.contains(&l.as_str()));
        for label in add {
            if !message.label_ids.iter().any(|l| l == label) {
                message.label_ids.push((*label).to_owned());
            }
        }
        message.label_ids.sort();
        ok(json!({"id": id, "labelIds": message.label_ids}))
    }
}

fn ok(body: Value) -> ProviderResponse {
    ProviderResponse { status: 200, body }
}

fn not_found() -> ProviderResponse {
    ProviderResponse {
        status: 404,
        body: json!({"error": {"message": "Requested entity was not found."}}),
    }
}

#[async_trait]
impl MailProvider for StubProvider {
    async fn list_messages(&self, query: &CategoryQuery) -> AppResult<ProviderResponse> {
        if let Some(failure) = self.enter() {
            return Ok(failure);
        }
        *self.last_query.lock().expect("lock") = Some(query.query.clone());
        let messages = self.messages.lock().expect("lock");
        let items = messages
            .values()
            .take(query.page_size)
            .map(|m| json!({"id": m.id, "threadId": m.thread_id}))
            .collect::<Vec<_>>();
        if items.is_empty() {
            return Ok(ok(json!({"resultSizeEstimate": 0})));
        }
        Ok(ok(json!({"messages": items, "resultSizeEstimate": items.len()})))
    }

    async fn get_message(&self, id: &str, _format: MessageFormat) -> AppResult<ProviderResponse> {
        if let Some(failure) = self.enter() {
            return Ok(failure);
        }
        let messages = self.messages.lock().expect("lock");
        Ok(match messages.get(id) {
            Some(message) => ok(serde_json::to_value(message).expect("serializes")),
            None => not_found(),
        })
    }

    async fn send_raw(&self, raw: &str, thread_id: Option<&str>) -> AppResult<ProviderResponse> {
        if let Some(failure) = self.enter() {
            return Ok(failure);
        }
        let mut sent = self.sent.lock().expect("lock");
        sent.push(SentMessage {
            raw: raw.to_owned(),
            thread_id: thread_id.map(str::to_owned),
        });
        let id = format!("sent-{}", sent.len());
        let thread = thread_id.map(str::to_owned).unwrap_or_else(|| id.clone());
        Ok(ok(json!({"id": id, "threadId": thread, "labelIds": ["SENT"]})))
    }

    async fn modify_labels(
        &self,
        id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> AppResult<ProviderResponse> {
        if let Some(failure) = self.enter() {
            return Ok(failure);
        }
        self.modify_calls.lock().expect("lock").push((
            add.iter().map(|l| (*l).to_owned()).collect(),
            remove.iter().map(|l| (*l).to_owned()).collect(),
        ));
        Ok(self.relabel(id, add, remove))
    }

    async fn trash_message(&self, id: &str) -> AppResult<ProviderResponse> {
        if let Some(failure) = self.enter() {
            return Ok(failure);
        }
        Ok(self.relabel(id, &["TRASH"], &["INBOX"]))
    }

    async fn untrash_message(&self, id: &str) -> AppResult<ProviderResponse> {
        if let Some(failure) = self.enter() {
            return Ok(failure);
        }
        Ok(self.relabel(id, &["INBOX"], &["TRASH"]))
    }

    async fn delete_message(&self, id: &str) -> AppResult<ProviderResponse> {
        if let Some(failure) = self.enter() {
            return Ok(failure);
        }
        Ok(match self.messages.lock().expect("lock").remove(id) {
            Some(_) => ProviderResponse {
                status: 204,
                body: Value::Null,
            },
            None => not_found(),
        })
    }
}

/// Factory handing out one shared stub and counting connections
pub struct StubFactory {
    provider: Arc<StubProvider>,
    connections: AtomicUsize,
}

impl StubFactory {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl ProviderFactory for StubFactory {
    fn connect(&self, _credential: &AccountCredential) -> Arc<dyn MailProvider> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.provider.clone()
    }
}

fn header(name: &str, value: &str) -> MessageHeader {
    MessageHeader {
        name: name.to_owned(),
        value: value.to_owned(),
    }
}

fn text_part(mime_type: &str, text: &str) -> MessagePart {
    MessagePart {
        mime_type: mime_type.to_owned(),
        headers: Vec::new(),
        body: Some(PartBody {
            data: Some(URL_SAFE_NO_PAD.encode(text.as_bytes())),
            size: text.len() as u64,
        }),
        parts: Vec::new(),
    }
}

fn stub_headers(id: &str, from: &str, subject: &str) -> Vec<MessageHeader> {
    vec![
        header("From", from),
        header("To", "me@x.com"),
        header("Subject", subject),
        header("Date", "Mon, 1 Jan 2024 10:00:00 +0000"),
        header("Message-ID", &format!("<{id}@stub.example>")),
    ]
}

/// Single-part `text/plain` message
pub fn stub_message(id: &str, from: &str, subject: &str, body: &str, labels: &[&str]) -> GmailMessage {
    let mut payload = text_part("text/plain", body);
    payload.headers = stub_headers(id, from, subject);
    GmailMessage {
        id: id.to_owned(),
        thread_id: Some(id.to_owned()),
        label_ids: labels.iter().map(|l| (*l).to_owned()).collect(),
        snippet: body.chars().take(50).collect(),
        payload: Some(payload),
        raw: None,
    }
}

/// `multipart/alternative` message with plain and html parts
pub fn two_part_message(id: &str) -> GmailMessage {
    GmailMessage {
        id: id.to_owned(),
        thread_id: Some(id.to_owned()),
        label_ids: vec!["INBOX".to_owned()],
        snippet: "plain version".to_owned(),
        payload: Some(MessagePart {
            mime_type: "multipart/alternative".to_owned(),
            headers: stub_headers(id, "Alice <alice@x.com>", "Two parts"),
            body: None,
            parts: vec![
                text_part("text/plain", "plain version"),
                text_part("text/html", "<p>html version</p>"),
            ],
        }),
        raw: None,
    }
}

pub fn test_context(provider: Arc<StubProvider>) -> OperationContext {
    OperationContext {
        provider,
        credential: AccountCredential {
            account_id: "a1".to_owned(),
            email: "me@x.com".to_owned(),
            access_token: SecretString::new("at".into()),
            refresh_token: SecretString::new("rt".into()),
        },
        config: Arc::new(ServerConfig::default()),
    }
}

pub fn test_gateway(
    accounts: MemoryAccountStore,
    provider: Arc<StubProvider>,
) -> (Gateway, Arc<StubFactory>) {
    test_gateway_with(ServerConfig::default(), accounts, provider)
}

pub fn test_gateway_with(
    config: ServerConfig,
    accounts: MemoryAccountStore,
    provider: Arc<StubProvider>,
) -> (Gateway, Arc<StubFactory>) {
    let factory = Arc::new(StubFactory {
        provider,
        connections: AtomicUsize::new(0),
    });
    let gateway = Gateway::new(Arc::new(config), Arc::new(accounts), factory.clone());
    (gateway, factory)
}

/// Interpreter that replays scripted replies, then a fallback if set
#[derive(Default)]
pub struct ScriptedInterpreter {
    replies: Mutex<VecDeque<InterpreterReply>>,
    fallback: Option<InterpreterReply>,
    delay: Option<Duration>,
    requests: Mutex<Vec<InterpreterRequest>>,
}

impl ScriptedInterpreter {
    pub fn new(replies: Vec<InterpreterReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Answer every turn with the same reply
    pub fn always(reply: InterpreterReply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("lock").len()
    }

    pub fn requests(&self) -> Vec<InterpreterRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn next_turn(&self, request: &InterpreterRequest) -> AppResult<InterpreterReply> {
        self.requests.lock().expect("lock").push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.replies.lock().expect("lock").pop_front();
        scripted
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| AppError::Interpreter("script exhausted".to_owned()))
    }
}
