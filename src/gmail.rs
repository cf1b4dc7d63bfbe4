//! Provider client adapter
//!
//! Thin REST client for the Gmail `users.messages` resource. Every call is
//! bounded by `provider_timeout_ms`; network failures and timeouts map to
//! `ProviderUnavailable`, while non-2xx responses are passed back as
//! [`ProviderResponse`] with their status intact so callers decide how to
//! report them. A 401 triggers one token refresh and retry when an OAuth
//! client is configured.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::{OAuthClientConfig, ServerConfig};
use crate::errors::{AppError, AppResult};
use crate::identity::AccountCredential;
use crate::query::CategoryQuery;

/// Raw provider response: status plus parsed JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    /// HTTP status returned by the provider
    pub status: u16,
    /// JSON body; `Null` for empty bodies, a string for non-JSON bodies
    pub body: Value,
}

impl ProviderResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Convert to the body, mapping non-2xx statuses to `ProviderError`
    pub fn into_result(self) -> AppResult<Value> {
        if self.is_success() {
            return Ok(self.body);
        }
        let message = self
            .body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| self.body.as_str().map(str::to_owned))
            .unwrap_or_else(|| "request rejected".to_owned());
        Err(AppError::ProviderError {
            status: self.status,
            message,
        })
    }
}

/// `format` parameter of `messages.get`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// Headers plus the decoded MIME tree
    Full,
    /// Headers only
    Metadata,
}

impl MessageFormat {
    fn as_str(self) -> &'static str {
        match self {
            MessageFormat::Full => "full",
            MessageFormat::Metadata => "metadata",
        }
    }
}

/// Mail provider operations used by the catalog
///
/// `Err` is reserved for transport failures (`ProviderUnavailable`);
/// provider rejections come back as a non-2xx [`ProviderResponse`].
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// `messages.list` with a search query and paging
    async fn list_messages(&self, query: &CategoryQuery) -> AppResult<ProviderResponse>;
    /// `messages.get`
    async fn get_message(&self, id: &str, format: MessageFormat) -> AppResult<ProviderResponse>;
    /// `messages.send` with an already-encoded raw message
    async fn send_raw(&self, raw: &str, thread_id: Option<&str>) -> AppResult<ProviderResponse>;
    /// `messages.modify`
    async fn modify_labels(
        &self,
        id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> AppResult<ProviderResponse>;
    /// `messages.trash`
    async fn trash_message(&self, id: &str) -> AppResult<ProviderResponse>;
    /// `messages.untrash`
    async fn untrash_message(&self, id: &str) -> AppResult<ProviderResponse>;
    /// `messages.delete` (permanent)
    async fn delete_message(&self, id: &str) -> AppResult<ProviderResponse>;
}

/// Builds a provider client for a resolved credential
pub trait ProviderFactory: Send + Sync {
    fn connect(&self, credential: &AccountCredential) -> Arc<dyn MailProvider>;
}

/// Factory producing [`GmailClient`]s that share one connection pool
#[derive(Clone)]
pub struct GmailProviderFactory {
    http: reqwest::Client,
    config: Arc<ServerConfig>,
}

impl GmailProviderFactory {
    /// # Errors
    ///
    /// - `Internal` if the HTTP client cannot be constructed
    pub fn new(config: Arc<ServerConfig>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }
}

impl ProviderFactory for GmailProviderFactory {
    fn connect(&self, credential: &AccountCredential) -> Arc<dyn MailProvider> {
        Arc::new(GmailClient::new(self.http.clone(), &self.config, credential))
    }
}

/// Gmail REST client bound to one account
pub struct GmailClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    account_id: String,
    access_token: Mutex<SecretString>,
    refresh_token: SecretString,
    oauth: Option<OAuthClientConfig>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl GmailClient {
    pub fn new(
        http: reqwest::Client,
        config: &ServerConfig,
        credential: &AccountCredential,
    ) -> Self {
        Self {
            http,
            base_url: config.provider_base_url.clone(),
            request_timeout: Duration::from_millis(config.provider_timeout_ms),
            account_id: credential.account_id.clone(),
            access_token: Mutex::new(credential.access_token.clone()),
            refresh_token: credential.refresh_token.clone(),
            oauth: config.oauth.clone(),
        }
    }

    fn message_path(&self, id: &str, suffix: &str) -> String {
        format!(
            "{}/users/me/messages/{}{suffix}",
            self.base_url,
            urlencoding::encode(id)
        )
    }

    /// Send a request, refreshing the access token once on 401
    async fn execute(
        &self,
        method: Method,
        url: String,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> AppResult<ProviderResponse> {
        let started = Instant::now();
        let response = self.send_once(&method, &url, query, body.as_ref()).await?;
        let response = if response.status == 401 && self.oauth.is_some() && self.refresh().await
        {
            self.send_once(&method, &url, query, body.as_ref()).await?
        } else {
            response
        };

        tracing::debug!(
            account_id = %self.account_id,
            method = %method,
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "provider request"
        );
        Ok(response)
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> AppResult<ProviderResponse> {
        let token = self.access_token.lock().await.clone();
        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token.expose_secret())
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = timeout(self.request_timeout, request.send())
            .await
            .map_err(|_| AppError::ProviderUnavailable("provider request timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::ProviderUnavailable(format!("provider request failed: {e}")))
            })?;
        let status = response.status().as_u16();

        let bytes = timeout(self.request_timeout, response.bytes())
            .await
            .map_err(|_| AppError::ProviderUnavailable("provider response timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::ProviderUnavailable(format!("provider response failed: {e}")))
            })?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(ProviderResponse { status, body })
    }

    /// Exchange the refresh token for a new access token
    ///
    /// Returns `false` (and keeps the old token) when the exchange fails, so
    /// the caller reports the original 401.
    async fn refresh(&self) -> bool {
        let Some(oauth) = self.oauth.as_ref() else {
            return false;
        };
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.expose_secret()),
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.expose_secret()),
        ];

        let result = timeout(
            self.request_timeout,
            self.http.post(&oauth.token_url).form(&form).send(),
        )
        .await;
        let response = match result {
            Ok(Ok(r)) if r.status().is_success() => r,
            Ok(Ok(r)) => {
                tracing::warn!(
                    account_id = %self.account_id,
                    status = r.status().as_u16(),
                    "token refresh rejected"
                );
                return false;
            }
            Ok(Err(e)) => {
                tracing::warn!(account_id = %self.account_id, "token refresh failed: {e}");
                return false;
            }
            Err(_) => {
                tracing::warn!(account_id = %self.account_id, "token refresh timed out");
                return false;
            }
        };

        match response.json::<TokenResponse>().await {
            Ok(token) => {
                *self.access_token.lock().await = SecretString::new(token.access_token.into());
                tracing::info!(account_id = %self.account_id, "access token refreshed");
                true
            }
            Err(e) => {
                tracing::warn!(account_id = %self.account_id, "malformed token response: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn list_messages(&self, query: &CategoryQuery) -> AppResult<ProviderResponse> {
        let mut params = vec![
            ("q", query.query.clone()),
            ("maxResults", query.page_size.to_string()),
        ];
        if let Some(token) = &query.page_token {
            params.push(("pageToken", token.clone()));
        }
        self.execute(
            Method::GET,
            format!("{}/users/me/messages", self.base_url),
            &params,
            None,
        )
        .await
    }

    async fn get_message(&self, id: &str, format: MessageFormat) -> AppResult<ProviderResponse> {
        self.execute(
            Method::GET,
            self.message_path(id, ""),
            &[("format", format.as_str().to_owned())],
            None,
        )
        .await
    }

    async fn send_raw(&self, raw: &str, thread_id: Option<&str>) -> AppResult<ProviderResponse> {
        let mut body = json!({ "raw": raw });
        if let Some(thread_id) = thread_id {
            body["threadId"] = json!(thread_id);
        }
        self.execute(
            Method::POST,
            format!("{}/users/me/messages/send", self.base_url),
            &[],
            Some(body),
        )
        .await
    }

    async fn modify_labels(
        &self,
        id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> AppResult<ProviderResponse> {
        self.execute(
            Method::POST,
            self.message_path(id, "/modify"),
            &[],
            Some(json!({ "addLabelIds": add, "removeLabelIds": remove })),
        )
        .await
    }

    async fn trash_message(&self, id: &str) -> AppResult<ProviderResponse> {
        self.execute(Method::POST, self.message_path(id, "/trash"), &[], None)
            .await
    }

    async fn untrash_message(&self, id: &str) -> AppResult<ProviderResponse> {
        self.execute(Method::POST, self.message_path(id, "/untrash"), &[], None)
            .await
    }

    async fn delete_message(&self, id: &str) -> AppResult<ProviderResponse> {
        self.execute(Method::DELETE, self.message_path(id, ""), &[], None)
            .await
    }
}
