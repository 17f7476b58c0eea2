//! # OpenAI 兼容客户端测试集
//!
//! 测试 OpenAiClient 与 BaseClient：
//! - 配置默认值与构建器
//! - 请求体格式（模型、stream、工具声明、Bearer 鉴权）
//! - SSE 流解码为文本增量与完整的工具调用
//! - 429 与其它错误状态的分类
//! - 监控指标（使用 mockito 模拟上游）

use finchat_gateway::config::ProviderConfig;
use finchat_gateway::llm_api::openai::client::OpenAiClient;
use finchat_gateway::llm_api::provider::{ChatProvider, ProviderChunk, ProviderError, ProviderRequest};
use finchat_gateway::llm_api::utils::{
    client::{ClientConfig, TimeoutConfig},
    msg_structure::Message,
    tool_structure::ToolDefinition,
};
use futures::StreamExt;
use mockito::{Matcher, Server};
use serde_json::json;
use std::time::Duration;

/// 创建测试用的请求
fn create_request(tools: Vec<ToolDefinition>) -> ProviderRequest {
    ProviderRequest {
        model: "gemini-2.0-flash".to_string(),
        messages: vec![
            Message::system("You are a helpful assistant.".to_string()),
            Message::user("What is the price of FPT?".to_string()),
        ],
        tools,
        temperature: Some(0.2),
    }
}

fn create_price_tool() -> ToolDefinition {
    ToolDefinition::function(
        "get_current_stock_price",
        "Get the latest price",
        json!({"type": "object", "properties": {"symbol": {"type": "string"}}, "required": ["symbol"]}),
    )
}

/// 把若干 JSON 片段拼成 SSE 响应体
fn sse_body(chunks: &[serde_json::Value]) -> String {
    let mut body: String = chunks.iter().map(|c| format!("data: {}\n\n", c)).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

async fn collect_chunks(client: &OpenAiClient, request: &ProviderRequest) -> Vec<Result<ProviderChunk, ProviderError>> {
    let stream = client.open_stream("sk-test", request).await.expect("stream should open");
    stream.collect().await
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== 配置类测试 ==========

    #[test]
    fn test_timeout_config_builder() {
        let config = TimeoutConfig::new()
            .with_request_timeout(Duration::from_secs(60))
            .with_connect_timeout(Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new()
            .add_header("X-Test".to_string(), "value".to_string())
            .with_user_agent("Test-Agent/1.0".to_string());
        assert_eq!(config.default_headers.get("X-Test"), Some(&"value".to_string()));
        assert_eq!(config.user_agent, "Test-Agent/1.0");
    }

    #[test]
    fn test_from_provider_config() {
        let provider = ProviderConfig {
            base_url: "http://localhost:9999/v1/".to_string(),
            user_agent: "FinChat-Test/0.1".to_string(),
            ..ProviderConfig::default()
        };
        let client = OpenAiClient::from_config(&provider).unwrap();
        assert_eq!(client.base_url(), "http://localhost:9999/v1");
        assert_eq!(client.base_client().config().user_agent, "FinChat-Test/0.1");
        assert_eq!(client.name(), "openai-compatible");
    }

    // ========== 流式响应 ==========

    #[tokio::test]
    async fn test_streams_text_deltas_in_order() {
        println!("=== Testing text streaming ===");
        let mut server = Server::new_async().await;
        let body = sse_body(&[
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "FPT "}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "is trading "}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "at 100."}, "finish_reason": "stop"}]}),
        ]);
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({"model": "gemini-2.0-flash", "stream": true})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = OpenAiClient::new_with_base_url(server.url()).unwrap();
        let chunks = collect_chunks(&client, &create_request(vec![])).await;
        println!("chunks: {:?}", chunks);

        mock.assert_async().await;
        let texts: Vec<String> = chunks
            .into_iter()
            .map(|c| match c.unwrap() {
                ProviderChunk::Text(text) => text,
                other => panic!("unexpected chunk {:?}", other),
            })
            .collect();
        assert_eq!(texts.concat(), "FPT is trading at 100.");
        assert_eq!(client.base_client().metrics().successful_requests, 1);
    }

    #[tokio::test]
    async fn test_assembles_tool_call_from_fragments() {
        println!("=== Testing tool call assembly ===");
        let mut server = Server::new_async().await;
        let body = sse_body(&[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_abc", "type": "function",
                 "function": {"name": "get_current_stock_price", "arguments": "{\"sym"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "bol\": \"FPT\"}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ]);
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({"stream": true})),
                Matcher::Regex(r#""tools":\["#.to_string()),
                Matcher::Regex(r#""name":"get_current_stock_price""#.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = OpenAiClient::new_with_base_url(server.url()).unwrap();
        let chunks = collect_chunks(&client, &create_request(vec![create_price_tool()])).await;

        mock.assert_async().await;
        assert_eq!(chunks.len(), 1);
        let Ok(ProviderChunk::ToolCalls(calls)) = &chunks[0] else {
            panic!("expected tool calls, got {:?}", chunks[0]);
        };
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].function.name, "get_current_stock_price");
        let arguments: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(arguments, json!({"symbol": "FPT"}));
    }

    #[tokio::test]
    async fn test_truncated_stream_without_done_still_ends() {
        let mut server = Server::new_async().await;
        let body = format!(
            "data: {}\n\ndata: {}",
            json!({"choices": [{"delta": {"content": "partial"}}]}),
            json!({"choices": [{"delta": {"content": " tail"}}]})
        );
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let client = OpenAiClient::new_with_base_url(server.url()).unwrap();
        let chunks = collect_chunks(&client, &create_request(vec![])).await;
        let texts: Vec<ProviderChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(
            texts,
            vec![
                ProviderChunk::Text("partial".to_string()),
                ProviderChunk::Text(" tail".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_line_is_protocol_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body("data: {not json}\n\n")
            .create_async()
            .await;

        let client = OpenAiClient::new_with_base_url(server.url()).unwrap();
        let chunks = collect_chunks(&client, &create_request(vec![])).await;
        assert!(matches!(chunks.last(), Some(Err(ProviderError::Protocol { .. }))));
    }

    // ========== 错误分类 ==========

    #[tokio::test]
    async fn test_429_is_rate_limited_with_retry_after() {
        println!("=== Testing rate limit classification ===");
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_header("retry-after", "7")
            .with_body(json!({"error": {"code": 429, "message": "Resource has been exhausted"}}).to_string())
            .create_async()
            .await;

        let client = OpenAiClient::new_with_base_url(server.url()).unwrap();
        let error = client.open_stream("sk-test", &create_request(vec![])).await.err().unwrap();
        println!("error: {}", error);

        assert!(error.is_rate_limited());
        assert!(matches!(
            error,
            ProviderError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(7)
        ));
        let metrics = client.base_client().metrics();
        assert_eq!(metrics.rate_limited_requests, 1);
        assert_eq!(metrics.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_server_error_is_upstream_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let client = OpenAiClient::new_with_base_url(server.url()).unwrap();
        let error = client.open_stream("sk-test", &create_request(vec![])).await.err().unwrap();
        assert_eq!(
            error,
            ProviderError::Upstream {
                status: Some(503),
                message: "overloaded".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_inline_rate_limit_error_in_stream() {
        let mut server = Server::new_async().await;
        let body = format!(
            "data: {}\n\n",
            json!({"error": {"code": 429, "message": "quota exceeded"}})
        );
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let client = OpenAiClient::new_with_base_url(server.url()).unwrap();
        let chunks = collect_chunks(&client, &create_request(vec![])).await;
        assert!(matches!(chunks.last(), Some(Err(e)) if e.is_rate_limited()));
    }

    #[tokio::test]
    async fn test_empty_messages_rejected_locally() {
        let client = OpenAiClient::new_with_base_url("http://127.0.0.1:9".to_string()).unwrap();
        let request = ProviderRequest {
            messages: vec![],
            ..create_request(vec![])
        };
        let error = client.open_stream("sk-test", &request).await.err().unwrap();
        assert!(matches!(error, ProviderError::Protocol { .. }));
    }
}
