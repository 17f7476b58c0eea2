//! # 网关配置
//!
//! 所有长生命周期组件（Key Pool、并发闸门、会话存储、工具调用器、模型客户端）
//! 的配置都集中在 `GatewayConfig` 中，启动时从环境变量装配一次，之后只读。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 模型供应商配置（OpenAI 兼容接口）
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// 接口基础 URL，请求会发往 `{base_url}/chat/completions`
    pub base_url: String,
    /// 有序的模型层级：第一个为主模型，其余依次为备用模型
    pub model_tiers: Vec<String>,
    /// 单次尝试的最长耗时（含流式读取）
    pub attempt_timeout: Duration,
    /// 连接超时
    pub connect_timeout: Duration,
    /// 采样温度
    pub temperature: Option<f32>,
    /// 用户代理
    pub user_agent: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            model_tiers: vec!["gemini-2.0-flash".to_string(), "gemini-1.5-flash".to_string()],
            attempt_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            temperature: Some(0.2),
            user_agent: "FinChat-Gateway/1.0".to_string(),
        }
    }
}

/// Key Pool 配置
#[derive(Debug, Clone)]
pub struct KeyPoolConfig {
    /// 原始 API Key 列表
    pub api_keys: Vec<String>,
    /// 首次限流后的冷却时长，后续按 2 的幂递增
    pub cooldown_base: Duration,
    /// 冷却时长上限
    pub cooldown_max: Duration,
    /// 连续硬错误达到该次数后，凭证被标记为 exhausted
    pub hard_error_threshold: u32,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            cooldown_base: Duration::from_secs(60),
            cooldown_max: Duration::from_secs(15 * 60),
            hard_error_threshold: 5,
        }
    }
}

/// 指数退避参数
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// 第一次重试的基础延迟
    pub base_delay: Duration,
    /// 每次重试的放大倍数
    pub multiplier: f64,
    /// 延迟上限（含抖动）
    pub max_delay: Duration,
    /// 抖动比例，取值 [0, 1]，抖动量为计算延迟的该比例以内
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// 重试与模型降级配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub backoff: BackoffConfig,
    /// 当前层级连续失败多少次后降级到下一个模型
    pub tier_failure_threshold: u32,
    /// 硬错误（网络、超时、响应格式错误）在同一层级上的最大重试次数
    pub max_hard_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            tier_failure_threshold: 3,
            max_hard_retries: 2,
        }
    }
}

/// 并发闸门配置
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// 全进程最多同时进行的上游调用数
    pub capacity: usize,
    /// 等待闸门的最长时间，超过即返回 Congested
    pub acquire_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// 同一会话出现并发请求时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// 排队，按到达顺序依次执行
    Queue,
    /// 直接拒绝，返回 SessionConflict
    Reject,
}

impl FromStr for SessionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(SessionPolicy::Queue),
            "reject" => Ok(SessionPolicy::Reject),
            other => Err(format!("unknown session policy '{}', expected queue|reject", other)),
        }
    }
}

/// 会话存储配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub policy: SessionPolicy,
    /// 会话空闲多久后被回收，None 表示永不回收
    pub idle_ttl: Option<Duration>,
    /// 回收任务的执行间隔
    pub eviction_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: SessionPolicy::Queue,
            idle_ttl: Some(Duration::from_secs(3600)),
            eviction_interval: Duration::from_secs(300),
        }
    }
}

/// 工具配置
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// 单次对话内最多允许的工具调用轮数
    pub max_tool_depth: u32,
    /// 行情数据接口基础 URL
    pub market_data_base_url: String,
    /// Google Custom Search API Key
    pub search_api_key: Option<String>,
    /// Google Custom Search 引擎 ID
    pub search_cse_id: Option<String>,
    /// 搜索结果条数
    pub search_results: u8,
    /// 工具结果缓存 TTL
    pub cache_ttl: Duration,
    /// 工具结果缓存容量
    pub cache_capacity: u64,
    /// 工具后端请求超时
    pub request_timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            max_tool_depth: 5,
            market_data_base_url: "https://apipubaws.tcbs.com.vn".to_string(),
            search_api_key: None,
            search_cse_id: None,
            search_results: 5,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 128,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// 完整的网关配置
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub provider: ProviderConfig,
    pub key_pool: KeyPoolConfig,
    pub retry: RetryConfig,
    pub gate: GateConfig,
    pub session: SessionConfig,
    pub tools: ToolConfig,
    /// HTTP 监听地址
    pub bind_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            key_pool: KeyPoolConfig::default(),
            retry: RetryConfig::default(),
            gate: GateConfig::default(),
            session: SessionConfig::default(),
            tools: ToolConfig::default(),
            bind_addr: "127.0.0.1:8010".to_string(),
        }
    }
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 没有找到任何 API Key
    MissingApiKeys { prefix: String },
    /// 没有配置任何模型层级
    EmptyModelTiers,
    /// 某个配置项无法解析或不合法
    InvalidValue { key: String, value: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingApiKeys { prefix } => {
                write!(f, "No API keys found with prefix '{}'", prefix)
            }
            ConfigError::EmptyModelTiers => write!(f, "At least one model tier must be configured"),
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "Invalid value '{}' for {}: {}", value, key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// API Key 环境变量前缀，支持 `LLM_API_KEY_1`、`LLM_API_KEY_2`… 以及单个 `LLM_API_KEY`
pub const API_KEY_PREFIX: &str = "LLM_API_KEY";

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_keys(mut self, keys: Vec<String>) -> Self {
        self.key_pool.api_keys = keys;
        self
    }

    pub fn with_model_tiers(mut self, tiers: Vec<String>) -> Self {
        self.provider.model_tiers = tiers;
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_tools(mut self, tools: ToolConfig) -> Self {
        self.tools = tools;
        self
    }

    /// 从进程环境变量装配配置
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 通过任意查找函数装配配置（测试时可以传入 HashMap）
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = GatewayConfig::default();

        config.key_pool.api_keys = load_api_keys(&lookup, API_KEY_PREFIX);

        if let Some(base_url) = lookup("LLM_BASE_URL") {
            config.provider.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(tiers) = lookup("LLM_MODEL_TIERS") {
            config.provider.model_tiers = tiers
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        config.provider.attempt_timeout =
            Duration::from_secs(parse_or(&lookup, "ATTEMPT_TIMEOUT_SECS", 120u64)?);
        if let Some(raw) = lookup("LLM_TEMPERATURE") {
            config.provider.temperature = Some(parse_value("LLM_TEMPERATURE", &raw)?);
        }

        config.key_pool.cooldown_base =
            Duration::from_secs(parse_or(&lookup, "KEY_COOLDOWN_SECS", 60u64)?);
        config.key_pool.cooldown_max =
            Duration::from_secs(parse_or(&lookup, "KEY_COOLDOWN_MAX_SECS", 900u64)?);
        config.key_pool.hard_error_threshold =
            parse_or(&lookup, "KEY_HARD_ERROR_THRESHOLD", 5u32)?;

        config.retry.backoff.base_delay =
            Duration::from_millis(parse_or(&lookup, "RETRY_BASE_DELAY_MS", 1000u64)?);
        config.retry.backoff.multiplier = parse_or(&lookup, "RETRY_MULTIPLIER", 2.0f64)?;
        config.retry.backoff.max_delay =
            Duration::from_millis(parse_or(&lookup, "RETRY_MAX_DELAY_MS", 30_000u64)?);
        config.retry.backoff.jitter = parse_or(&lookup, "RETRY_JITTER", 0.2f64)?;
        config.retry.tier_failure_threshold = parse_or(&lookup, "TIER_FAILURE_THRESHOLD", 3u32)?;
        config.retry.max_hard_retries = parse_or(&lookup, "MAX_HARD_RETRIES", 2u32)?;

        config.gate.capacity = parse_or(&lookup, "MAX_CONCURRENT_REQUESTS", 20usize)?;
        config.gate.acquire_timeout =
            Duration::from_secs(parse_or(&lookup, "GATE_TIMEOUT_SECS", 30u64)?);

        if let Some(raw) = lookup("SESSION_POLICY") {
            config.session.policy = raw.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "SESSION_POLICY".to_string(),
                value: raw.clone(),
                reason,
            })?;
        }
        let idle_secs: u64 = parse_or(&lookup, "SESSION_IDLE_TTL_SECS", 3600u64)?;
        config.session.idle_ttl = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));

        config.tools.max_tool_depth = parse_or(&lookup, "MAX_TOOL_DEPTH", 5u32)?;
        if let Some(url) = lookup("MARKET_DATA_BASE_URL") {
            config.tools.market_data_base_url = url.trim_end_matches('/').to_string();
        }
        config.tools.search_api_key = lookup("SEARCH_ENGINE_API_KEY").filter(|v| !v.is_empty());
        config.tools.search_cse_id = lookup("SEARCH_ENGINE_CSE_ID").filter(|v| !v.is_empty());
        config.tools.cache_ttl = Duration::from_secs(parse_or(&lookup, "TOOL_CACHE_TTL_SECS", 300u64)?);

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }

        config.validate()?;
        Ok(config)
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_pool.api_keys.is_empty() {
            return Err(ConfigError::MissingApiKeys {
                prefix: API_KEY_PREFIX.to_string(),
            });
        }
        if self.provider.model_tiers.is_empty() {
            return Err(ConfigError::EmptyModelTiers);
        }
        if self.gate.capacity == 0 {
            return Err(invalid("MAX_CONCURRENT_REQUESTS", "0", "capacity must be positive"));
        }
        if self.retry.backoff.multiplier < 1.0 {
            return Err(invalid(
                "RETRY_MULTIPLIER",
                &self.retry.backoff.multiplier.to_string(),
                "multiplier must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.backoff.jitter) {
            return Err(invalid(
                "RETRY_JITTER",
                &self.retry.backoff.jitter.to_string(),
                "jitter must be within [0, 1]",
            ));
        }
        if self.retry.tier_failure_threshold == 0 {
            return Err(invalid("TIER_FAILURE_THRESHOLD", "0", "threshold must be positive"));
        }
        Ok(())
    }
}

/// 加载按序号编号的 Key（PREFIX_1, PREFIX_2, …），再补上不带编号的 PREFIX
fn load_api_keys<F>(lookup: &F, prefix: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut keys = Vec::new();
    let mut index = 1;
    while let Some(key) = lookup(&format!("{}_{}", prefix, index)) {
        if key.trim().is_empty() {
            break;
        }
        keys.push(key.trim().to_string());
        index += 1;
    }
    if let Some(single) = lookup(prefix) {
        let single = single.trim().to_string();
        if !single.is_empty() && !keys.contains(&single) {
            keys.push(single);
        }
    }
    keys
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| invalid(key, raw, &e.to_string()))
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
