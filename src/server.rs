//! MCP server implementation with tool handlers
//!
//! Exposes every catalog operation as an MCP tool over stdio. Tools run under
//! a fixed identity (`MAIL_GATEWAY_MCP_IDENTITY` or `--identity`) and return
//! the operation's [`OperationResult`] inside the standard envelope.

use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;

use crate::catalog::OperationRequest;
use crate::errors::{AppError, AppResult};
use crate::gateway::Gateway;
use crate::identity::Session;
use crate::models::{
    ForwardInput, ListMessagesInput, MessageIdInput, Meta, OperationResult, ReplyInput,
    SearchMessagesInput, SendMessageInput, ToolEnvelope,
};

/// Mail gateway MCP server
#[derive(Clone)]
pub struct MailGatewayServer {
    gateway: Arc<Gateway>,
    session: Session,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailGatewayServer {
    /// Tool descriptions come from the catalog descriptors
    pub fn new(gateway: Arc<Gateway>, session: Session) -> Self {
        let mut tool_router = Self::tool_router();
        for route in tool_router.map.values_mut() {
            if let Some(descriptor) = gateway.catalog().get(&route.attr.name) {
                route.attr.description = Some(descriptor.description.into());
            }
        }
        Self {
            gateway,
            session,
            tool_router,
        }
    }

    #[tool(name = "list_messages")]
    async fn list_messages(
        &self,
        Parameters(input): Parameters<ListMessagesInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("list_messages", &input).await
    }

    #[tool(name = "search_messages")]
    async fn search_messages(
        &self,
        Parameters(input): Parameters<SearchMessagesInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("search_messages", &input).await
    }

    #[tool(name = "get_message")]
    async fn get_message(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("get_message", &input).await
    }

    #[tool(name = "get_labels")]
    async fn get_labels(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("get_labels", &input).await
    }

    #[tool(name = "send_message")]
    async fn send_message(
        &self,
        Parameters(input): Parameters<SendMessageInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("send_message", &input).await
    }

    #[tool(name = "reply_to_message")]
    async fn reply_to_message(
        &self,
        Parameters(input): Parameters<ReplyInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("reply_to_message", &input).await
    }

    #[tool(name = "forward_message")]
    async fn forward_message(
        &self,
        Parameters(input): Parameters<ForwardInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("forward_message", &input).await
    }

    #[tool(name = "star_message")]
    async fn star_message(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("star_message", &input).await
    }

    #[tool(name = "unstar_message")]
    async fn unstar_message(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("unstar_message", &input).await
    }

    #[tool(name = "mark_read")]
    async fn mark_read(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("mark_read", &input).await
    }

    #[tool(name = "mark_unread")]
    async fn mark_unread(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("mark_unread", &input).await
    }

    #[tool(name = "trash_message")]
    async fn trash_message(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("trash_message", &input).await
    }

    #[tool(name = "untrash_message")]
    async fn untrash_message(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("untrash_message", &input).await
    }

    #[tool(name = "delete_message")]
    async fn delete_message(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        self.run("delete_message", &input).await
    }
}

/// MCP server handler implementation
#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailGatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Gmail operation gateway. Read tools are always available; send, label and delete tools require MAIL_GATEWAY_WRITE_ENABLED=true.",
        )
    }
}

impl MailGatewayServer {
    /// Dispatch through the gateway and wrap the result
    ///
    /// Credential failures become MCP errors; operation failures stay in the
    /// envelope with `outcome: failure`.
    async fn run<T: Serialize>(
        &self,
        name: &str,
        input: &T,
    ) -> Result<Json<ToolEnvelope<OperationResult>>, ErrorData> {
        let started = Instant::now();
        let result = self.execute(name, input).await;
        finalize_tool(started, result.map(|r| (r.summary.clone(), r)))
    }

    async fn execute<T: Serialize>(&self, name: &str, input: &T) -> AppResult<OperationResult> {
        let arguments = serde_json::to_value(input)
            .map_err(|e| AppError::Internal(format!("failed to encode arguments: {e}")))?;
        self.gateway
            .execute(&self.session, &OperationRequest::new(name, arguments))
            .await
    }
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Build a standardized MCP tool response envelope from business logic output
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rmcp::handler::server::wrapper::Parameters;

    use super::MailGatewayServer;
    use crate::identity::Session;
    use crate::models::MessageIdInput;
    use crate::testing::{MemoryAccountStore, StubProvider, stub_message, test_gateway};

    fn server(provider: Arc<StubProvider>, identity: Option<&str>) -> MailGatewayServer {
        let accounts = MemoryAccountStore::with_account("a1", "me@x.com", Some("at"), Some("rt"));
        let (gateway, _) = test_gateway(accounts, provider);
        let session = Session {
            identity: identity.map(str::to_owned),
        };
        MailGatewayServer::new(Arc::new(gateway), session)
    }

    #[tokio::test]
    async fn tool_wraps_operation_result_in_envelope() {
        let provider = Arc::new(
            StubProvider::new().with_message(stub_message("m1", "bob@x.com", "Hi", "hello", &["INBOX", "UNREAD"])),
        );
        let server = server(provider.clone(), Some("me@x.com"));
        let envelope = server
            .mark_read(Parameters(MessageIdInput { id: "m1".to_owned() }))
            .await
            .expect("tool succeeds")
            .0;
        assert!(envelope.data.succeeded());
        assert_eq!(envelope.summary, "Message m1 marked as read.");
        assert!(!provider.labels_of("m1").contains("UNREAD"));
    }

    #[tokio::test]
    async fn missing_identity_is_an_mcp_error() {
        let server = server(Arc::new(StubProvider::new()), None);
        let err = server
            .get_labels(Parameters(MessageIdInput { id: "m1".to_owned() }))
            .await
            .err()
            .expect("must fail");
        assert!(err.message.contains("not authenticated"));
    }

    #[test]
    fn tools_mirror_catalog_names_and_descriptions() {
        let server = server(Arc::new(StubProvider::new()), Some("me@x.com"));
        let catalog = server.gateway.catalog();
        let tools = server.tool_router.list_all();
        assert_eq!(tools.len(), catalog.descriptors().count());
        for tool in tools {
            let descriptor = catalog.get(&tool.name).expect("tool is a catalog operation");
            assert_eq!(tool.description.as_deref(), Some(descriptor.description));
        }
    }
}
