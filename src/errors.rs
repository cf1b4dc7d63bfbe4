//! Application error model with MCP and HTTP error mapping
//!
//! Defines the gateway's error taxonomy using `thiserror`. Every variant has a
//! stable machine code, an HTTP-style status, and a plain-language
//! explanation, so callers can surface failures without exposing raw codes.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Credential variants (`Unauthenticated`, `AccountNotFound`,
/// `CredentialsMissing`) abort a whole turn. Everything else is scoped to a
/// single operation call and reported back as a failed `OperationResult`.
#[derive(Debug, Error)]
pub enum AppError {
    /// No session, or the session carries no identity
    #[error("not authenticated")]
    Unauthenticated,
    /// The session identity has no local account record
    #[error("account not found: {0}")]
    AccountNotFound(String),
    /// The account exists but its token pair is absent or incomplete
    #[error("credentials missing: {0}")]
    CredentialsMissing(String),
    /// Argument validation failed before any network call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Non-2xx response from the mail provider, status preserved
    #[error("provider returned status {status}: {message}")]
    ProviderError { status: u16, message: String },
    /// Network failure or timeout talking to the mail provider
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// A single-target lookup found nothing
    #[error("not found: {0}")]
    NotFound(String),
    /// The language-model collaborator failed or returned garbage
    #[error("interpreter failure: {0}")]
    Interpreter(String),
    /// The enclosing request was cancelled
    #[error("request cancelled")]
    Cancelled,
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidArgument`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Stable snake_case identifier for programmatic callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::AccountNotFound(_) => "account_not_found",
            Self::CredentialsMissing(_) => "credentials_missing",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ProviderError { .. } => "provider_error",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Interpreter(_) => "interpreter_error",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP-style status code
    ///
    /// `ProviderError` keeps the provider's own status so it survives all the
    /// way up to the turn result.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated => 401,
            Self::AccountNotFound(_) => 404,
            Self::CredentialsMissing(_) => 412,
            Self::InvalidArgument(_) => 400,
            Self::ProviderError { status, .. } => *status,
            Self::ProviderUnavailable(_) => 503,
            Self::NotFound(_) => 404,
            Self::Interpreter(_) => 502,
            Self::Cancelled => 499,
            Self::Internal(_) => 500,
        }
    }

    /// Whether this error must abort the entire turn
    pub fn is_turn_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated
                | Self::AccountNotFound(_)
                | Self::CredentialsMissing(_)
                | Self::Cancelled
        )
    }

    /// Plain-language explanation without status codes
    pub fn plain_language(&self) -> String {
        match self {
            Self::Unauthenticated => "You need to sign in before I can access your mailbox.".to_owned(),
            Self::AccountNotFound(_) => {
                "I could not find a mail account linked to your sign-in.".to_owned()
            }
            Self::CredentialsMissing(_) => {
                "Your mail account is linked but its access has not been granted. Please reconnect it.".to_owned()
            }
            Self::InvalidArgument(msg) => format!("Some required details were missing or malformed: {msg}."),
            Self::ProviderError { status, .. } => match status {
                401 | 403 => "The mail provider refused access to your mailbox.".to_owned(),
                404 => "The mail provider could not find that message.".to_owned(),
                429 => "The mail provider is rate limiting requests right now.".to_owned(),
                _ => "The mail provider rejected the request.".to_owned(),
            },
            Self::ProviderUnavailable(_) => {
                "The mail provider could not be reached in time.".to_owned()
            }
            Self::NotFound(_) => "I could not find that message.".to_owned(),
            Self::Interpreter(_) => "The assistant could not interpret the request.".to_owned(),
            Self::Cancelled => "The request was cancelled.".to_owned(),
            Self::Internal(_) => "Something went wrong on our side.".to_owned(),
        }
    }

    /// Convert to MCP `ErrorData`
    ///
    /// # Mappings
    ///
    /// - `InvalidArgument` → `invalid_params`
    /// - `NotFound`, `AccountNotFound` → `resource_not_found`
    /// - `Unauthenticated`, `CredentialsMissing` → `invalid_request`
    /// - everything else → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let data = Some(json!({ "code": self.code(), "status": self.status_code() }));
        let msg = self.to_string();
        match self {
            Self::InvalidArgument(_) => ErrorData::invalid_params(msg, data),
            Self::NotFound(_) | Self::AccountNotFound(_) => {
                ErrorData::resource_not_found(msg, data)
            }
            Self::Unauthenticated | Self::CredentialsMissing(_) => {
                ErrorData::invalid_request(msg, data)
            }
            Self::ProviderError { .. }
            | Self::ProviderUnavailable(_)
            | Self::Interpreter(_)
            | Self::Cancelled
            | Self::Internal(_) => ErrorData::internal_error(msg, data),
        }
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;
