//! mail-intent-gateway: natural-language mailbox gateway
//!
//! Lets a language model drive a fixed catalog of Gmail operations on behalf
//! of a signed-in user. Served either over HTTP (one conversational turn per
//! request) or as an MCP server over stdio.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, CLI, and serving
//! - [`config`]: Environment-driven configuration
//! - [`errors`]: Application error model with MCP and HTTP error mapping
//! - [`identity`]: Session to account credential resolution
//! - [`gmail`]: Provider REST client with timeouts and token refresh
//! - [`mime`]: Message decode/encode for the provider wire format
//! - [`query`]: Category and free-text to provider query construction
//! - [`models`]: Input/output DTOs and schema-bearing types
//! - [`catalog`]: Operation registry, validation, and result shaping
//! - [`gateway`]: Credential resolution plus catalog dispatch
//! - [`interpreter`]: Language-model collaborator (chat completions)
//! - [`orchestrator`]: Bounded tool-orchestration loop
//! - [`http`]: HTTP routes
//! - [`server`]: MCP tool handlers

mod catalog;
mod config;
mod errors;
mod gateway;
mod gmail;
mod http;
mod identity;
mod interpreter;
mod mime;
mod models;
mod orchestrator;
mod query;
mod server;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::ServerConfig;
use gateway::Gateway;
use gmail::GmailProviderFactory;
use identity::{JsonFileAccountStore, Session};
use interpreter::ChatCompletionsInterpreter;
use orchestrator::Orchestrator;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mail-intent-gateway", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API
    Http {
        /// Listen address (overrides MAIL_GATEWAY_HTTP_ADDR)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Serve MCP tools over stdio
    Mcp {
        /// Mailbox identity the tools act for (overrides MAIL_GATEWAY_MCP_IDENTITY)
        #[arg(long)]
        identity: Option<String>,
    },
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, and serves the chosen
/// surface. Logs go to stderr so stdout stays free for the MCP transport.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// MAIL_GATEWAY_ACCOUNTS_FILE=accounts.json \
/// MAIL_GATEWAY_LLM_API_KEY=gsk_... \
/// cargo run -- http --addr 127.0.0.1:8787
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load_from_env()?;
    match &cli.command {
        Command::Http { addr: Some(addr) } => config.http_addr = addr.clone(),
        Command::Mcp {
            identity: Some(identity),
        } => config.mcp_identity = Some(identity.clone()),
        _ => {}
    }

    let config = Arc::new(config);
    let providers = GmailProviderFactory::new(Arc::clone(&config))?;
    let accounts = JsonFileAccountStore::new(config.accounts_file.clone());
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&config),
        Arc::new(accounts),
        Arc::new(providers),
    ));

    match cli.command {
        Command::Http { .. } => serve_http(config, gateway).await,
        Command::Mcp { .. } => {
            let session = config
                .mcp_identity
                .clone()
                .map(Session::for_identity)
                .unwrap_or_default();
            let service = server::MailGatewayServer::new(gateway, session)
                .serve(stdio())
                .await?;
            service.waiting().await?;
            Ok(())
        }
    }
}

async fn serve_http(
    config: Arc<ServerConfig>,
    gateway: Arc<Gateway>,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.llm_api_key.is_none() {
        tracing::warn!("MAIL_GATEWAY_LLM_API_KEY is unset; interpreter calls carry no key");
    }
    let interpreter = ChatCompletionsInterpreter::new(reqwest::Client::new(), &config);
    let shutdown = CancellationToken::new();
    let state = http::AppState {
        gateway: Arc::clone(&gateway),
        orchestrator: Arc::new(Orchestrator::new(gateway, Arc::new(interpreter))),
        shutdown: shutdown.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    tracing::info!(addr = %config.http_addr, "HTTP gateway listening");
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
