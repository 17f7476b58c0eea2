//! # 工具调用
//!
//! 模型在流中请求的函数调用由 `ToolInvoker` 按名称分派到已注册的工具。
//! 任何失败（参数错误、后端错误、未知工具）都变成带 error 字段的工具结果回传给模型，
//! 不会中断对话。

pub mod cache;
pub mod market_data;
pub mod web_search;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ToolConfig;
use crate::llm_api::utils::client::ClientError;
use crate::llm_api::utils::msg_structure::ToolCallMessage;
use crate::llm_api::utils::tool_structure::ToolDefinition;
use cache::CacheService;

/// 工具执行错误
#[derive(Debug, Clone, PartialEq)]
pub enum ToolError {
    /// 参数缺失或格式不对
    InvalidArguments(String),
    /// 后端服务返回错误或不可达
    Backend(String),
    /// 工具依赖的配置缺失（例如搜索 API Key）
    NotConfigured(String),
    /// 没有这个名字的工具
    UnknownTool(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            ToolError::Backend(msg) => write!(f, "Backend error: {}", msg),
            ToolError::NotConfigured(msg) => write!(f, "Tool not configured: {}", msg),
            ToolError::UnknownTool(name) => write!(f, "Unknown tool: {}", name),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<ClientError> for ToolError {
    fn from(error: ClientError) -> Self {
        ToolError::Backend(error.to_string())
    }
}

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON 编码的参数
    pub arguments: String,
}

impl From<&ToolCallMessage> for ToolCall {
    fn from(message: &ToolCallMessage) -> Self {
        Self {
            id: message.id.clone(),
            name: message.function.name.clone(),
            arguments: message.function.arguments.clone(),
        }
    }
}

/// 工具执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    /// 回传给模型的文本
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    fn success(call: &ToolCall, value: &Value) -> Self {
        let output = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output,
            is_error: false,
        }
    }

    fn failure(call: &ToolCall, error: &ToolError) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output: json!({ "error": error.to_string() }).to_string(),
            is_error: true,
        }
    }
}

/// 统一的工具接口
#[async_trait]
pub trait Tool: Send + Sync {
    /// 注册名，同时也是声明中的函数名
    fn name(&self) -> &'static str;

    /// 发给模型的 JSON Schema 声明
    fn definition(&self) -> ToolDefinition;

    /// 结果是否可以缓存
    fn cacheable(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, ToolError>;
}

/// 取必填的字符串参数
pub fn required_str(arguments: &Value, key: &str) -> Result<String, ToolError> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing string field '{}'", key)))
}

/// 工具注册表与调用器
#[derive(Clone)]
pub struct ToolInvoker {
    tools: HashMap<String, Arc<dyn Tool>>,
    cache: CacheService<String, Value>,
}

impl ToolInvoker {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            tools: HashMap::new(),
            cache: CacheService::new(config.cache_ttl, config.cache_capacity),
        }
    }

    /// 创建带全部内置工具的调用器
    pub fn with_default_tools(config: &ToolConfig) -> Result<Self, ClientError> {
        let market = Arc::new(market_data::MarketDataClient::new(
            config.market_data_base_url.clone(),
            config.request_timeout,
        )?);
        let mut invoker = Self::new(config);
        invoker.register(market_data::StockPriceTool::new(market.clone()));
        invoker.register(market_data::CompanyOverviewTool::new(market.clone()));
        invoker.register(market_data::FinancialStatementTool::new(market));
        invoker.register(web_search::SearchTool::from_config(config)?);
        Ok(invoker)
    }

    /// 注册工具，同名工具会被替换
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            warn!(tool = %name, "Tool replaced in registry");
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 全部工具声明，按名称排序
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name().cmp(b.name()));
        definitions
    }

    /// 执行一次工具调用；永远返回结果，失败也会包装成结果
    pub async fn invoke(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name).cloned() else {
            warn!(tool = %call.name, "Model requested unknown tool");
            return ToolResult::failure(call, &ToolError::UnknownTool(call.name.clone()));
        };

        let arguments: Value = match serde_json::from_str(&call.arguments) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) | Err(_) => {
                let error = ToolError::InvalidArguments(format!("arguments must be a JSON object: {}", call.arguments));
                return ToolResult::failure(call, &error);
            }
        };

        let outcome = if tool.cacheable() {
            let key = format!("{}:{}", call.name, arguments);
            self.cache
                .get_or_try_load(key, || async { tool.invoke(&arguments).await })
                .await
        } else {
            tool.invoke(&arguments).await
        };

        match outcome {
            Ok(value) => {
                debug!(tool = %call.name, call_id = %call.id, "Tool call succeeded");
                ToolResult::success(call, &value)
            }
            Err(error) => {
                warn!(tool = %call.name, call_id = %call.id, error = %error, "Tool call failed");
                ToolResult::failure(call, &error)
            }
        }
    }

    /// 并发执行同一轮的全部调用，结果保持调用顺序
    pub async fn invoke_all(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        info!(count = calls.len(), "Invoking tool calls");
        join_all(calls.iter().map(|call| self.invoke(call))).await
    }
}
