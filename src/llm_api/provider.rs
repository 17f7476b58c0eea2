//! # 模型供应商抽象
//!
//! 编排引擎只依赖这里定义的 `ChatProvider` trait：给定模型、凭证、上下文和工具声明，
//! 返回一个按到达顺序产出文本增量或工具调用的流。

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

use crate::llm_api::utils::{
    client::ClientError,
    msg_structure::{Message, ToolCallMessage},
    tool_structure::ToolDefinition,
};

/// 一次上游调用的请求内容
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// 本次尝试使用的模型（由当前层级决定）
    pub model: String,
    /// 重建后的完整上下文
    pub messages: Vec<Message>,
    /// 提供给模型的工具声明
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
}

/// 流中的一个片段
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderChunk {
    /// 文本增量
    Text(String),
    /// 模型在本轮请求的全部工具调用（已拼装完整）
    ToolCalls(Vec<ToolCallMessage>),
}

/// 供应商错误
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// 被限流（HTTP 429），可换 Key 立即重试
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// 网络错误、5xx 或其它非成功状态
    Upstream { status: Option<u16>, message: String },
    /// 流格式无法解析
    Protocol { message: String },
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }

    /// 凭证本身被拒绝（401/403），与网络或服务端故障区分开
    pub fn is_credential_rejected(&self) -> bool {
        matches!(self, ProviderError::Upstream { status: Some(401 | 403), .. })
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::RateLimited { message, .. } => write!(f, "Rate limited: {}", message),
            ProviderError::Upstream { status: Some(status), message } => {
                write!(f, "Upstream error (status {}): {}", status, message)
            }
            ProviderError::Upstream { status: None, message } => write!(f, "Upstream error: {}", message),
            ProviderError::Protocol { message } => write!(f, "Malformed stream: {}", message),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<ClientError> for ProviderError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::RateLimited { message, retry_after } => ProviderError::RateLimited { retry_after, message },
            ClientError::Api { message, status_code } => ProviderError::Upstream {
                status: Some(status_code),
                message,
            },
            ClientError::Serialization { source } => ProviderError::Protocol {
                message: source.to_string(),
            },
            other => ProviderError::Upstream {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

/// 供应商返回的片段流
pub type ChunkStream = BoxStream<'static, Result<ProviderChunk, ProviderError>>;

/// 模型供应商
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// 发起一次流式对话；返回 Err 表示连接阶段即失败
    async fn open_stream(&self, api_key: &str, request: &ProviderRequest) -> Result<ChunkStream, ProviderError>;

    /// 供应商名称，用于日志
    fn name(&self) -> &'static str;
}
