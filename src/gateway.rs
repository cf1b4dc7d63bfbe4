//! Email operation gateway
//!
//! Ties identity resolution, the provider factory and the catalog together.
//! Every entry point resolves a fresh credential from the session; nothing is
//! cached between requests.

use std::sync::Arc;

use crate::catalog::{Catalog, OperationContext, OperationRequest};
use crate::config::ServerConfig;
use crate::errors::AppResult;
use crate::gmail::ProviderFactory;
use crate::identity::{self, AccountStore, Session};
use crate::models::OperationResult;

pub struct Gateway {
    config: Arc<ServerConfig>,
    accounts: Arc<dyn AccountStore>,
    providers: Arc<dyn ProviderFactory>,
    catalog: Catalog,
}

impl Gateway {
    pub fn new(
        config: Arc<ServerConfig>,
        accounts: Arc<dyn AccountStore>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            config,
            accounts,
            providers,
            catalog: Catalog::standard(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Resolve the session and bind a provider client to its credential
    ///
    /// # Errors
    ///
    /// - `Unauthenticated`, `AccountNotFound`, `CredentialsMissing` from
    ///   identity resolution; no provider client is built in that case
    pub async fn open_context(&self, session: &Session) -> AppResult<OperationContext> {
        let credential = identity::resolve(session, self.accounts.as_ref()).await?;
        let provider = self.providers.connect(&credential);
        Ok(OperationContext {
            provider,
            credential,
            config: Arc::clone(&self.config),
        })
    }

    /// Execute one operation outside of a conversational turn
    ///
    /// Credential failures are returned as `Err`; everything after that is
    /// folded into the [`OperationResult`].
    pub async fn execute(
        &self,
        session: &Session,
        request: &OperationRequest,
    ) -> AppResult<OperationResult> {
        let ctx = self.open_context(session).await?;
        Ok(self.catalog.dispatch(&ctx, request).await)
    }
}
