//! Configuration module for the gateway
//!
//! All configuration is loaded from environment variables following the
//! pattern `MAIL_GATEWAY_<KEY>`. Command-line flags may override the listen
//! address and the MCP identity after loading.

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Upper bound accepted for `MAIL_GATEWAY_MAX_STEPS`
pub const MAX_STEP_BOUND: usize = 8;
/// Largest accepted `MAIL_GATEWAY_MAX_PAGE_SIZE`
const MAX_PAGE_SIZE_BOUND: usize = 500;

/// OAuth client used for transparent token refresh
///
/// Only present when both client id and secret are configured.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    /// OAuth client identifier
    pub client_id: String,
    /// OAuth client secret, never logged
    pub client_secret: SecretString,
    /// Token endpoint used for `grant_type=refresh_token`
    pub token_url: String,
}

/// Server-wide configuration
///
/// Cloned into handlers via `Arc` for thread-safe shared access. Holds no
/// per-account state: credentials are resolved per request from the account
/// store.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// JSON file backing the account store
    pub accounts_file: PathBuf,
    /// Mail provider REST base URL
    pub provider_base_url: String,
    /// Per round-trip provider timeout in milliseconds
    pub provider_timeout_ms: u64,
    /// OAuth client for refresh-on-401, if configured
    pub oauth: Option<OAuthClientConfig>,
    /// OpenAI-compatible chat completions base URL
    pub llm_base_url: String,
    /// API key for the chat completions endpoint
    pub llm_api_key: Option<SecretString>,
    /// Model name sent with every completion request
    pub llm_model: String,
    /// Interpreter request timeout in milliseconds
    pub llm_timeout_ms: u64,
    /// Hard cap on interpreter round trips per turn
    pub max_steps: usize,
    /// Upper bound for list/search page size
    pub max_page_size: usize,
    /// Whether mutating operations (send, delete, label changes) are enabled
    pub write_enabled: bool,
    /// HTTP header carrying the identity asserted by the auth collaborator
    pub session_header: String,
    /// HTTP listen address
    pub http_addr: String,
    /// Identity used for the MCP stdio surface
    pub mcp_identity: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accounts_file: PathBuf::from("accounts.json"),
            provider_base_url: "https://gmail.googleapis.com/gmail/v1".to_owned(),
            provider_timeout_ms: 30_000,
            oauth: None,
            llm_base_url: "https://api.groq.com/openai/v1".to_owned(),
            llm_api_key: None,
            llm_model: "meta-llama/llama-4-scout-17b-16e-instruct".to_owned(),
            llm_timeout_ms: 60_000,
            max_steps: 4,
            max_page_size: 50,
            write_enabled: true,
            session_header: "x-authenticated-email".to_owned(),
            http_addr: "127.0.0.1:8787".to_owned(),
            mcp_identity: None,
        }
    }
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// Unset variables fall back to [`ServerConfig::default`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a variable is set but malformed, if
    /// `MAIL_GATEWAY_MAX_STEPS` is outside `1..=8`, or if only one half of the
    /// OAuth client pair is configured.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_GATEWAY_ACCOUNTS_FILE=/var/lib/gateway/accounts.json
    /// MAIL_GATEWAY_OAUTH_CLIENT_ID=1234.apps.googleusercontent.com
    /// MAIL_GATEWAY_OAUTH_CLIENT_SECRET=secret
    /// MAIL_GATEWAY_LLM_API_KEY=gsk_...
    /// MAIL_GATEWAY_MAX_STEPS=4
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let defaults = Self::default();

        let max_steps = check_range(
            "MAIL_GATEWAY_MAX_STEPS",
            parse_usize_env("MAIL_GATEWAY_MAX_STEPS", defaults.max_steps)?,
            MAX_STEP_BOUND,
        )?;
        let max_page_size = check_range(
            "MAIL_GATEWAY_MAX_PAGE_SIZE",
            parse_usize_env("MAIL_GATEWAY_MAX_PAGE_SIZE", defaults.max_page_size)?,
            MAX_PAGE_SIZE_BOUND,
        )?;

        let oauth = match (
            optional_env("MAIL_GATEWAY_OAUTH_CLIENT_ID")?,
            optional_env("MAIL_GATEWAY_OAUTH_CLIENT_SECRET")?,
        ) {
            (Some(client_id), Some(secret)) => Some(OAuthClientConfig {
                client_id,
                client_secret: SecretString::new(secret.into()),
                token_url: string_env(
                    "MAIL_GATEWAY_OAUTH_TOKEN_URL",
                    "https://oauth2.googleapis.com/token",
                )?,
            }),
            (None, None) => None,
            _ => {
                return Err(AppError::invalid(
                    "MAIL_GATEWAY_OAUTH_CLIENT_ID and MAIL_GATEWAY_OAUTH_CLIENT_SECRET must be set together",
                ));
            }
        };

        Ok(Self {
            accounts_file: PathBuf::from(string_env(
                "MAIL_GATEWAY_ACCOUNTS_FILE",
                &defaults.accounts_file.to_string_lossy(),
            )?),
            provider_base_url: trim_base_url(string_env(
                "MAIL_GATEWAY_PROVIDER_BASE_URL",
                &defaults.provider_base_url,
            )?),
            provider_timeout_ms: parse_u64_env(
                "MAIL_GATEWAY_PROVIDER_TIMEOUT_MS",
                defaults.provider_timeout_ms,
            )?,
            oauth,
            llm_base_url: trim_base_url(string_env(
                "MAIL_GATEWAY_LLM_BASE_URL",
                &defaults.llm_base_url,
            )?),
            llm_api_key: optional_env("MAIL_GATEWAY_LLM_API_KEY")?
                .map(|key| SecretString::new(key.into())),
            llm_model: string_env("MAIL_GATEWAY_LLM_MODEL", &defaults.llm_model)?,
            llm_timeout_ms: parse_u64_env("MAIL_GATEWAY_LLM_TIMEOUT_MS", defaults.llm_timeout_ms)?,
            max_steps,
            max_page_size,
            write_enabled: parse_bool_env("MAIL_GATEWAY_WRITE_ENABLED", defaults.write_enabled)?,
            session_header: string_env("MAIL_GATEWAY_SESSION_HEADER", &defaults.session_header)?
                .to_ascii_lowercase(),
            http_addr: string_env("MAIL_GATEWAY_HTTP_ADDR", &defaults.http_addr)?,
            mcp_identity: optional_env("MAIL_GATEWAY_MCP_IDENTITY")?,
        })
    }
}

/// Strip trailing slashes so paths can be appended with `format!`
/// Accept `value` when it lies in `1..=max`
fn check_range(key: &str, value: usize, max: usize) -> AppResult<usize> {
    if (1..=max).contains(&value) {
        Ok(value)
    } else {
        Err(AppError::invalid(format!(
            "{key} must be in range 1..={max}, got {value}"
        )))
    }
}

fn trim_base_url(url: String) -> String {
    url.trim_end_matches('/').to_owned()
}

/// Read an optional environment variable; empty values count as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Read a string environment variable with default fallback
fn string_env(key: &str, default: &str) -> AppResult<String> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.to_owned()))
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match optional_env(key)? {
        Some(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::invalid(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` environment variable with default fallback
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match optional_env(key)? {
        Some(v) => v.parse::<u64>().map_err(|_| {
            AppError::invalid(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `usize` environment variable with default fallback
fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match optional_env(key)? {
        Some(v) => v.parse::<usize>().map_err(|_| {
            AppError::invalid(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::{MAX_STEP_BOUND, ServerConfig, check_range, parse_bool_value, trim_base_url};

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn defaults_bound_steps_and_pages() {
        let config = ServerConfig::default();
        assert_eq!(config.max_steps, 4);
        assert_eq!(config.max_page_size, 50);
        assert!(config.write_enabled);
        assert!(config.oauth.is_none());
    }

    #[test]
    fn step_bound_range_is_inclusive() {
        assert_eq!(check_range("MAIL_GATEWAY_MAX_STEPS", 1, MAX_STEP_BOUND).ok(), Some(1));
        assert_eq!(check_range("MAIL_GATEWAY_MAX_STEPS", 8, MAX_STEP_BOUND).ok(), Some(8));
        for rejected in [0, 9] {
            let err = check_range("MAIL_GATEWAY_MAX_STEPS", rejected, MAX_STEP_BOUND)
                .expect_err("out of range");
            assert!(
                err.to_string()
                    .contains("MAIL_GATEWAY_MAX_STEPS must be in range 1..=8")
            );
        }
    }

    #[test]
    fn base_urls_lose_trailing_slashes() {
        assert_eq!(
            trim_base_url("https://api.groq.com/openai/v1/".to_owned()),
            "https://api.groq.com/openai/v1"
        );
    }
}
