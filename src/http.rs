//! HTTP surface
//!
//! `POST /v1/turn` runs one conversational turn; `POST /v1/operations/{name}`
//! executes a single catalog operation directly. The signed-in identity is
//! read from a header set by the upstream auth proxy.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::catalog::OperationRequest;
use crate::errors::AppError;
use crate::gateway::Gateway;
use crate::identity::Session;
use crate::interpreter::{ChatMessage, Role};
use crate::models::OperationResult;
use crate::orchestrator::{Orchestrator, TurnOutcome};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled on shutdown; every turn runs on a child token
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/turn", post(turn))
        .route("/v1/operations", get(list_operations))
        .route("/v1/operations/{name}", post(execute_operation))
        .with_state(state)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.plain_language(),
                "status": self.status_code(),
            }
        }));
        (status, body).into_response()
    }
}

fn session_from(headers: &HeaderMap, header: &str) -> Session {
    let identity = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned);
    Session { identity }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct TurnRequest {
    messages: Vec<ChatMessage>,
}

async fn turn(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TurnOutcome>, AppError> {
    let request: TurnRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::invalid(format!("malformed turn request: {e}")))?;
    if request.messages.is_empty() {
        return Err(AppError::invalid("messages must not be empty"));
    }
    if request
        .messages
        .iter()
        .any(|m| !matches!(m.role, Role::User | Role::Assistant) || !m.tool_calls.is_empty())
    {
        return Err(AppError::invalid(
            "messages may only carry user and assistant text",
        ));
    }

    let session = session_from(&headers, &state.gateway.config().session_header);
    let turn_id = Uuid::new_v4();
    let outcome = state
        .orchestrator
        .handle_turn(&session, request.messages, state.shutdown.child_token())
        .instrument(tracing::info_span!("turn", %turn_id))
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct OperationInfo {
    name: &'static str,
    description: &'static str,
    mutating: bool,
    input_schema: Value,
}

async fn list_operations(State(state): State<AppState>) -> Json<Vec<OperationInfo>> {
    Json(
        state
            .gateway
            .catalog()
            .descriptors()
            .map(|d| OperationInfo {
                name: d.name,
                description: d.description,
                mutating: d.mutating,
                input_schema: d.input_schema(),
            })
            .collect(),
    )
}

async fn execute_operation(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OperationResult>, AppError> {
    let arguments = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::invalid(format!("request body is not JSON: {e}")))?
    };
    let session = session_from(&headers, &state.gateway.config().session_header);
    let result = state
        .gateway
        .execute(&session, &OperationRequest::new(name, arguments))
        .await?;
    Ok(Json(result))
}
