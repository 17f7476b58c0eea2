//! # OpenAI 兼容接口客户端
//!
//! 默认指向 Gemini 的 OpenAI 兼容端点，也可用于任何实现了
//! `/chat/completions` 流式接口的服务。每次调用携带调用方选定的 API Key。

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::llm_api::openai::stream::decode_stream;
use crate::llm_api::provider::{ChatProvider, ChunkStream, ProviderError, ProviderRequest};
use crate::llm_api::utils::{
    client::{BaseClient, ClientConfig, ClientError, TimeoutConfig},
    msg_structure::Message,
    tool_structure::ToolDefinition,
};

/// 流式 Chat 请求体
#[derive(Serialize, Debug, Clone)]
pub struct OpenAiChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub stream: bool,
    #[serde(skip_serializing_if = "no_tools")]
    pub tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

impl<'a> From<&'a ProviderRequest> for OpenAiChatRequest<'a> {
    fn from(request: &'a ProviderRequest) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            tools: &request.tools,
            temperature: request.temperature,
        }
    }
}

/// OpenAI 兼容客户端
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    base_client: BaseClient,
    base_url: String,
}

impl OpenAiClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta/openai";

    /// 使用默认配置创建客户端
    pub fn new() -> Result<Self, ClientError> {
        Self::new_with_base_url(Self::DEFAULT_BASE_URL.to_string())
    }

    /// 使用自定义基础 URL 创建客户端
    pub fn new_with_base_url(base_url: String) -> Result<Self, ClientError> {
        Self::new_with_config(base_url, ClientConfig::new())
    }

    /// 使用自定义配置创建客户端
    pub fn new_with_config(base_url: String, config: ClientConfig) -> Result<Self, ClientError> {
        let config = config.add_header("Content-Type".to_string(), "application/json".to_string());
        Ok(Self {
            base_client: BaseClient::new(config)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// 根据网关的供应商配置创建客户端
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ClientError> {
        let client_config = ClientConfig::new()
            .with_timeout(TimeoutConfig::new().with_connect_timeout(config.connect_timeout))
            .with_user_agent(config.user_agent.clone());
        Self::new_with_config(config.base_url.clone(), client_config)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn base_client(&self) -> &BaseClient {
        &self.base_client
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn open_stream(&self, api_key: &str, request: &ProviderRequest) -> Result<ChunkStream, ProviderError> {
        if request.messages.is_empty() {
            return Err(ProviderError::Protocol {
                message: "Messages cannot be empty".to_string(),
            });
        }

        let body = OpenAiChatRequest::from(request);
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Opening chat completion stream"
        );

        let response = self
            .base_client
            .post_stream(&self.completions_url(), Some(api_key), &body)
            .await?;

        Ok(decode_stream(Box::pin(response.bytes_stream())))
    }

    fn name(&self) -> &'static str {
        "openai-compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_omits_empty_tools() {
        let request = ProviderRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![Message::user("hi".to_string())],
            tools: Vec::new(),
            temperature: None,
        };
        let json = serde_json::to_value(OpenAiChatRequest::from(&request)).unwrap();
        assert_eq!(json["stream"], true);
        assert!(json.get("tools").is_none());
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = OpenAiClient::new_with_base_url("http://localhost:1234/v1/".to_string()).unwrap();
        assert_eq!(client.completions_url(), "http://localhost:1234/v1/chat/completions");
    }
}
