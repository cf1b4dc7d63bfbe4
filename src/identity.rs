//! Identity resolution
//!
//! Maps an authenticated session to the local account record and the OAuth
//! token pair the provider client needs. The account store is an external
//! collaborator behind [`AccountStore`]; the shipped implementation re-reads a
//! JSON file on every lookup so edits take effect without a restart.

use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::{AppError, AppResult};

/// Authenticated session supplied by the auth collaborator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Signed-in identity (email), if any
    pub identity: Option<String>,
}

impl Session {
    /// Session for a known identity
    pub fn for_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
        }
    }
}

/// Local account record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    /// Opaque account identifier
    pub account_id: String,
    /// Mailbox address of the account
    pub email: String,
}

/// OAuth token pair as stored; either half may be absent
#[derive(Debug, Clone, Default)]
pub struct TokenPair {
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
}

/// Resolved credential for one turn or one operation call
///
/// Created once per request and never cached across requests.
#[derive(Debug, Clone)]
pub struct AccountCredential {
    /// Opaque account identifier
    pub account_id: String,
    /// Mailbox address, used as the `From` of outgoing mail
    pub email: String,
    /// Short-lived bearer token
    pub access_token: SecretString,
    /// Long-lived token used for refresh
    pub refresh_token: SecretString,
}

/// Account store collaborator
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Look up the account linked to an identity
    async fn find_account_by_identity(&self, identity: &str) -> AppResult<Option<AccountRecord>>;

    /// Fetch the token pair for an account
    async fn get_token_pair(&self, account_id: &str) -> AppResult<TokenPair>;
}

/// Resolve a session into a usable credential
///
/// # Errors
///
/// - `Unauthenticated` if the session has no identity
/// - `AccountNotFound` if no account record exists for the identity
/// - `CredentialsMissing` if either token is absent
pub async fn resolve(session: &Session, store: &dyn AccountStore) -> AppResult<AccountCredential> {
    let identity = session
        .identity
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(AppError::Unauthenticated)?;

    let account = store
        .find_account_by_identity(identity)
        .await?
        .ok_or_else(|| AppError::AccountNotFound(identity.to_owned()))?;

    let tokens = store.get_token_pair(&account.account_id).await?;
    let (Some(access_token), Some(refresh_token)) = (tokens.access_token, tokens.refresh_token)
    else {
        return Err(AppError::CredentialsMissing(account.account_id));
    };

    tracing::debug!(account_id = %account.account_id, "resolved session credential");
    Ok(AccountCredential {
        account_id: account.account_id,
        email: account.email,
        access_token,
        refresh_token,
    })
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Vec<StoredAccount>,
}

#[derive(Debug, Deserialize)]
struct StoredAccount {
    account_id: String,
    email: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Account store backed by a JSON file
///
/// ```text
/// {"accounts": [{"account_id": "a1", "email": "me@example.com",
///                "access_token": "...", "refresh_token": "..."}]}
/// ```
///
/// Identity matching is case-insensitive. Empty token strings count as
/// absent.
#[derive(Debug, Clone)]
pub struct JsonFileAccountStore {
    path: PathBuf,
}

impl JsonFileAccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> AppResult<AccountsFile> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            AppError::Internal(format!(
                "failed to read account store {}: {e}",
                self.path.display()
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Internal(format!(
                "malformed account store {}: {e}",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl AccountStore for JsonFileAccountStore {
    async fn find_account_by_identity(&self, identity: &str) -> AppResult<Option<AccountRecord>> {
        let file = self.load().await?;
        Ok(file
            .accounts
            .into_iter()
            .find(|a| a.email.eq_ignore_ascii_case(identity))
            .map(|a| AccountRecord {
                account_id: a.account_id,
                email: a.email,
            }))
    }

    async fn get_token_pair(&self, account_id: &str) -> AppResult<TokenPair> {
        let file = self.load().await?;
        let Some(account) = file.accounts.into_iter().find(|a| a.account_id == account_id) else {
            return Ok(TokenPair::default());
        };
        Ok(TokenPair {
            access_token: non_empty_secret(account.access_token),
            refresh_token: non_empty_secret(account.refresh_token),
        })
    }
}

fn non_empty_secret(value: Option<String>) -> Option<SecretString> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| SecretString::new(v.into()))
}
