//! # 编排错误分类
//!
//! 每个错误码都有稳定的 snake_case 字符串，直接出现在 SSE 的 error 事件中。

use serde::Serialize;
use std::fmt;

/// 错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// 所有层级都因限流而失败
    RateLimited,
    /// 网络、超时、5xx 或流格式错误，重试用尽
    TransientUpstreamError,
    /// 工具执行失败（通常作为工具结果回传给模型，不会终止对话）
    ToolExecutionError,
    /// 等待并发闸门超时
    Congested,
    /// 同一会话已有进行中的请求（reject 策略）
    SessionConflict,
    /// 所有凭证都不可用
    Exhausted,
    /// 工具调用轮数超过上限
    ToolDepthExceeded,
    /// 客户端断开
    Cancelled,
    /// 请求参数不合法
    InvalidRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::TransientUpstreamError => "transient_upstream_error",
            ErrorCode::ToolExecutionError => "tool_execution_error",
            ErrorCode::Congested => "congested",
            ErrorCode::SessionConflict => "session_conflict",
            ErrorCode::Exhausted => "exhausted",
            ErrorCode::ToolDepthExceeded => "tool_depth_exceeded",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次对话交换的终止错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeError {
    pub code: ErrorCode,
    pub message: String,
}

impl ExchangeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn congested(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Congested, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "exchange cancelled by client")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ExchangeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_as_snake_case() {
        let json = serde_json::to_value(ErrorCode::TransientUpstreamError).unwrap();
        assert_eq!(json, "transient_upstream_error");
        assert_eq!(ErrorCode::SessionConflict.as_str(), "session_conflict");
    }

    #[test]
    fn test_display_includes_code() {
        let err = ExchangeError::congested("gate wait exceeded 30s");
        assert_eq!(err.to_string(), "congested: gate wait exceeded 30s");
    }
}
