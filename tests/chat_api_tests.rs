//! # HTTP 接口测试集
//!
//! 直接对路由做 oneshot 调用，不监听端口：
//! - 健康检查与系统信息
//! - SSE 流式问答、非流式问答、错误码到 HTTP 状态的映射
//! - 清空会话、运行状态、凭证恢复

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use finchat_gateway::config::GatewayConfig;
use finchat_gateway::engine::Orchestrator;
use finchat_gateway::llm_api::provider::{ChatProvider, ChunkStream, ProviderChunk, ProviderError, ProviderRequest};
use finchat_gateway::tools::ToolInvoker;
use finchat_gateway::web::handlers::chat_handler::SESSION_HEADER;
use finchat_gateway::web::server::create_app;
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

/// 回显最后一条消息的供应商
struct EchoProvider;

#[async_trait]
impl ChatProvider for EchoProvider {
    async fn open_stream(&self, _api_key: &str, request: &ProviderRequest) -> Result<ChunkStream, ProviderError> {
        let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(stream::iter(vec![Ok(ProviderChunk::Text(format!("echo: {}", last)))]).boxed())
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

fn create_orchestrator() -> Arc<Orchestrator> {
    let config = GatewayConfig::new()
        .with_api_keys(vec!["sk-a".to_string(), "sk-b".to_string()])
        .with_model_tiers(vec!["primary".to_string()]);
    Arc::new(Orchestrator::new(&config, Arc::new(EchoProvider), ToolInvoker::new(&config.tools)))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let app = create_app(create_orchestrator());
        let response = app.oneshot(get("/api/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "finchat-gateway");
    }

    #[tokio::test]
    async fn test_system_info() {
        let app = create_app(create_orchestrator());
        let body = body_json(app.oneshot(get("/api/system")).await.unwrap()).await;
        assert_eq!(body["credentials"], 2);
        assert_eq!(body["model_tiers"], json!(["primary"]));
    }

    #[tokio::test]
    async fn test_chat_stream_emits_sse_events() {
        println!("=== Testing SSE chat stream ===");
        let app = create_app(create_orchestrator());
        let response = app
            .oneshot(post_json("/api/v1/chat-stream", json!({"session_id": "s1", "query": "hi"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[SESSION_HEADER], "s1");

        let body = body_text(response).await;
        println!("body: {}", body);
        assert!(body.contains(r#"data: {"type":"delta","text":"echo: hi"}"#));
        assert!(body.contains(r#"data: {"type":"done"}"#));
    }

    #[tokio::test]
    async fn test_chat_stream_reports_errors_as_events() {
        let app = create_app(create_orchestrator());
        let response = app
            .oneshot(post_json("/api/v1/chat-stream", json!({"session_id": "s1", "query": ""})))
            .await
            .unwrap();

        let body = body_text(response).await;
        assert!(body.contains(r#""type":"error""#));
        assert!(body.contains(r#""code":"invalid_request""#));
    }

    #[tokio::test]
    async fn test_chat_generates_session_id_when_missing() {
        println!("=== Testing non-streaming chat ===");
        let app = create_app(create_orchestrator());
        let response = app
            .oneshot(post_json("/api/v1/chat", json!({"query": "hello"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["answer"], "echo: hello");
        let session_id = body["session_id"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(session_id).is_ok());
    }

    #[tokio::test]
    async fn test_chat_invalid_request_maps_to_400() {
        let app = create_app(create_orchestrator());
        let response = app
            .oneshot(post_json("/api/v1/chat", json!({"session_id": "s1", "query": "   "})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_clear_chat_and_stats() {
        println!("=== Testing clear chat ===");
        let orchestrator = create_orchestrator();
        let app = create_app(orchestrator.clone());

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/chat",
                json!({"session_id": "s1", "query": "q", "document_context": "Revenue: 42"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(orchestrator.sessions().snapshot("s1").len(), 2);

        let stats = body_json(app.clone().oneshot(get("/api/v1/stats")).await.unwrap()).await;
        assert_eq!(stats["sessions"], 1);
        assert_eq!(stats["credentials"].as_array().unwrap().len(), 2);
        assert_eq!(stats["gate"]["in_flight"], 0);

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/clear-chat?session_id=s1")
            .body(Body::empty())
            .unwrap();
        let body = body_json(app.clone().oneshot(request).await.unwrap()).await;
        assert_eq!(body["status"], "cleared");
        assert_eq!(body["had_history"], true);
        assert!(orchestrator.sessions().snapshot("s1").is_empty());
    }

    #[tokio::test]
    async fn test_reset_credential() {
        let orchestrator = create_orchestrator();
        let app = create_app(orchestrator.clone());
        let id = orchestrator.key_pool().stats()[0].id.clone();

        let response = app
            .clone()
            .oneshot(post_json(&format!("/api/v1/credentials/{}/reset", id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json("/api/v1/credentials/key-unknown/reset", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
