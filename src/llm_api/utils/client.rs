//! # 通用 HTTP 客户端基础设施
//!
//! 提供统一的客户端基础设施，包括：
//! - 超时管理和配置
//! - 状态码分类（限流 / 服务端错误 / 客户端错误）
//! - 请求监控指标
//! - 统一的错误类型
//!
//! 重试与降级不在这里做，由上层的重试策略统一决策。

use reqwest::{Client as HttpClient, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 超时配置
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// 非流式请求的总超时时间
    pub request_timeout: Duration,
    /// 连接超时时间
    pub connect_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TimeoutConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// 完整的客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 超时配置
    pub timeout: TimeoutConfig,
    /// 默认请求头
    pub default_headers: HashMap<String, String>,
    /// 用户代理
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutConfig::default(),
            default_headers: HashMap::new(),
            user_agent: "FinChat-Gateway/1.0".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn add_header(mut self, key: String, value: String) -> Self {
        self.default_headers.insert(key, value);
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// 客户端错误类型
#[derive(Debug)]
pub enum ClientError {
    /// 请求超时
    Timeout { duration: Duration },
    /// 网络错误
    Network { source: reqwest::Error },
    /// 被上游限流（HTTP 429）
    RateLimited { message: String, retry_after: Option<Duration> },
    /// 上游 API 返回的其它错误状态
    Api { message: String, status_code: u16 },
    /// 配置错误
    Config { message: String },
    /// 序列化错误
    Serialization { source: serde_json::Error },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Timeout { duration } => write!(f, "Request timeout after {:?}", duration),
            ClientError::Network { source } => write!(f, "Network error: {}", source),
            ClientError::RateLimited { message, retry_after } => {
                write!(f, "Rate limited (retry after {:?}): {}", retry_after, message)
            }
            ClientError::Api { message, status_code } => {
                write!(f, "API error: {} (status: {})", message, status_code)
            }
            ClientError::Config { message } => write!(f, "Configuration error: {}", message),
            ClientError::Serialization { source } => write!(f, "Serialization error: {}", source),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Network { source } => Some(source),
            ClientError::Serialization { source } => Some(source),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        ClientError::Network { source: error }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(error: serde_json::Error) -> Self {
        ClientError::Serialization { source: error }
    }
}

/// 请求上下文信息，用于日志记录和问题追踪
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// 请求唯一标识符
    pub request_id: String,
    /// 请求 URL
    pub url: String,
    /// 请求开始时间
    pub start_time: Instant,
    /// 是否为流式请求
    pub is_stream: bool,
}

impl RequestContext {
    pub fn new(url: &str, is_stream: bool) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            start_time: Instant::now(),
            is_stream,
        }
    }

    /// 获取总耗时
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// 客户端监控指标
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientMetrics {
    /// 总请求数
    pub total_requests: u64,
    /// 成功请求数
    pub successful_requests: u64,
    /// 失败请求数
    pub failed_requests: u64,
    /// 被限流的请求数
    pub rate_limited_requests: u64,
}

/// 通用 HTTP 客户端
#[derive(Debug, Clone)]
pub struct BaseClient {
    client: HttpClient,
    config: ClientConfig,
    metrics: Arc<Mutex<ClientMetrics>>,
}

impl BaseClient {
    /// 创建新的基础客户端
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::new_with_client(config, None)
    }

    /// 创建新的基础客户端，可注入自定义 HTTP 客户端（用于测试）
    pub fn new_with_client(config: ClientConfig, custom_client: Option<HttpClient>) -> Result<Self, ClientError> {
        let client = if let Some(client) = custom_client {
            client
        } else {
            // 不设置总超时：流式响应的时长由上层的单次尝试超时控制
            let mut client_builder = HttpClient::builder()
                .connect_timeout(config.timeout.connect_timeout)
                .user_agent(&config.user_agent);

            let mut default_headers = reqwest::header::HeaderMap::new();
            for (key, value) in &config.default_headers {
                if let (Ok(header_name), Ok(header_value)) = (
                    reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                    reqwest::header::HeaderValue::from_str(value),
                ) {
                    default_headers.insert(header_name, header_value);
                }
            }
            client_builder = client_builder.default_headers(default_headers);

            client_builder.build().map_err(|e| ClientError::Config {
                message: format!("Failed to build HTTP client: {}", e),
            })?
        };

        Ok(Self {
            client,
            config,
            metrics: Arc::new(Mutex::new(ClientMetrics::default())),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 获取监控指标快照
    pub fn metrics(&self) -> ClientMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// 发送 POST 请求并返回尚未读取的流式响应
    ///
    /// 只检查状态码；响应体由调用方按流读取。
    pub async fn post_stream<T>(&self, url: &str, bearer: Option<&str>, body: &T) -> Result<Response, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let ctx = RequestContext::new(url, true);
        debug!(request_id = %ctx.request_id, url = %ctx.url, "Starting streaming request");

        let mut builder = self.client.post(url).json(body);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                self.log_network_error(&ctx, &error);
                self.record(Outcome::Failed);
                return Err(ClientError::Network { source: error });
            }
        };

        self.check_status(&ctx, response).await
    }

    /// 发送 GET 请求并解析 JSON 响应（带总超时）
    pub async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, ClientError> {
        let ctx = RequestContext::new(url, false);
        let request_timeout = self.config.timeout.request_timeout;

        let send = self.client.get(url).query(query).send();
        let response = match timeout(request_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                self.log_network_error(&ctx, &error);
                self.record(Outcome::Failed);
                return Err(ClientError::Network { source: error });
            }
            Err(_) => {
                warn!(
                    request_id = %ctx.request_id,
                    url = %ctx.url,
                    timeout_ms = request_timeout.as_millis(),
                    "Request timeout occurred"
                );
                self.record(Outcome::Failed);
                return Err(ClientError::Timeout { duration: request_timeout });
            }
        };

        let response = self.check_status(&ctx, response).await?;
        let text = match timeout(request_timeout, response.text()).await {
            Ok(text) => text?,
            Err(_) => return Err(ClientError::Timeout { duration: request_timeout }),
        };
        Ok(serde_json::from_str(&text)?)
    }

    /// 按状态码把响应分类为成功、限流或 API 错误
    async fn check_status(&self, ctx: &RequestContext, response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            info!(
                request_id = %ctx.request_id,
                url = %ctx.url,
                is_stream = ctx.is_stream,
                elapsed_ms = ctx.elapsed().as_millis(),
                "Request accepted by upstream"
            );
            self.record(Outcome::Success);
            return Ok(response);
        }

        let retry_after = parse_retry_after(&response);
        let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(
                request_id = %ctx.request_id,
                url = %ctx.url,
                retry_after_ms = retry_after.map(|d| d.as_millis()),
                "Upstream rate limit hit"
            );
            self.record(Outcome::RateLimited);
            return Err(ClientError::RateLimited { message, retry_after });
        }

        error!(
            request_id = %ctx.request_id,
            url = %ctx.url,
            status_code = status.as_u16(),
            error_type = "api_error",
            error_message = %message,
            "Upstream API error occurred"
        );
        self.record(Outcome::Failed);
        Err(ClientError::Api {
            message,
            status_code: status.as_u16(),
        })
    }

    fn record(&self, outcome: Outcome) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.total_requests += 1;
            match outcome {
                Outcome::Success => metrics.successful_requests += 1,
                Outcome::RateLimited => {
                    metrics.failed_requests += 1;
                    metrics.rate_limited_requests += 1;
                }
                Outcome::Failed => metrics.failed_requests += 1,
            }
        }
    }

    /// 记录网络错误详细信息
    fn log_network_error(&self, ctx: &RequestContext, error: &reqwest::Error) {
        let error_details = format!(
            "is_timeout: {}, is_connect: {}, is_request: {}, status: {:?}",
            error.is_timeout(),
            error.is_connect(),
            error.is_request(),
            error.status()
        );

        error!(
            request_id = %ctx.request_id,
            url = %ctx.url,
            error_type = "network_error",
            error_details = %error_details,
            error_message = %error,
            "Network error occurred"
        );
    }
}

enum Outcome {
    Success,
    RateLimited,
    Failed,
}

/// 解析 Retry-After 头（只支持秒数形式）
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
