use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::engine::{ErrorCode, ExchangeError, Orchestrator};
use crate::web::dto::chat_dto::{
    ChatQueryRequest, ChatQueryResponse, ClearChatQuery, ClearChatResponse, ErrorResponse,
};

/// 响应头中回传实际使用的会话 ID
pub const SESSION_HEADER: &str = "x-session-id";

/// 错误码对应的 HTTP 状态
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::SessionConflict => StatusCode::CONFLICT,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Congested | ErrorCode::Exhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::TransientUpstreamError => StatusCode::BAD_GATEWAY,
        ErrorCode::ToolExecutionError | ErrorCode::ToolDepthExceeded | ErrorCode::Cancelled => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(error: ExchangeError) -> Response {
    (status_for(error.code), Json(ErrorResponse { error })).into_response()
}

/// 流式问答（SSE）
///
/// 每个事件是一行 `data: {"type": ...}`；客户端断开即取消本次交换。
pub async fn chat_stream(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payload): Json<ChatQueryRequest>,
) -> Response {
    let request = payload.into_exchange();
    let session_id = request.session_id.clone();
    info!(session_id = %session_id, "Streaming chat request received");

    let events = orchestrator
        .stream_answer(request)
        .map(|event| Event::default().json_data(&event));

    (
        [(SESSION_HEADER, session_id)],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// 非流式问答：等待完整回答
pub async fn chat(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payload): Json<ChatQueryRequest>,
) -> Response {
    let request = payload.into_exchange();
    let session_id = request.session_id.clone();
    info!(session_id = %session_id, "Chat request received");

    match orchestrator.answer(request).await {
        Ok(answer) => Json(ChatQueryResponse { session_id, answer }).into_response(),
        Err(error) => error_response(error),
    }
}

/// 清空会话历史
pub async fn clear_chat(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<ClearChatQuery>,
) -> Response {
    if query.session_id.trim().is_empty() {
        return error_response(ExchangeError::invalid_request("session_id cannot be empty"));
    }
    let had_history = orchestrator.clear_session(&query.session_id);
    info!(session_id = %query.session_id, had_history, "Chat history cleared");
    Json(ClearChatResponse {
        status: "cleared".to_string(),
        session_id: query.session_id,
        had_history,
    })
    .into_response()
}

/// 运行状态：闸门、凭证、会话数
pub async fn stats(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    Json(orchestrator.stats()).into_response()
}

/// 手动恢复一个被判定为耗尽的凭证
pub async fn reset_credential(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(credential_id): Path<String>,
) -> Response {
    if orchestrator.key_pool().reset(&credential_id) {
        info!(credential_id = %credential_id, "Credential reset");
        Json(json!({ "status": "reset", "credential_id": credential_id })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("credential {} not found", credential_id) })),
        )
            .into_response()
    }
}
