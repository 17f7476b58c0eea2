use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use anyhow::Result;

/// 日志级别枚举
#[derive(Debug, Clone)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for &'static str {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// 日志配置结构体
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 日志文件目录
    pub log_dir: String,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 是否启用控制台输出
    pub console_output: bool,
    /// 文件日志是否使用 JSON 格式
    pub json_format: bool,
    /// 日志文件滚动策略 (daily, hourly)
    pub rotation: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_dir: "logs".to_string(),
            file_prefix: "finchat".to_string(),
            console_output: true,
            json_format: false,
            rotation: "daily".to_string(),
        }
    }
}

impl LogConfig {
    /// 用 LOG_LEVEL / LOG_DIR / LOG_JSON 覆盖预设值，无法解析的值保持原样
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(level) = lookup("LOG_LEVEL").and_then(|v| v.parse().ok()) {
            self.level = level;
        }
        if let Some(dir) = lookup("LOG_DIR").filter(|v| !v.trim().is_empty()) {
            self.log_dir = dir;
        }
        if let Some(json) = lookup("LOG_JSON") {
            match json.trim() {
                "1" | "true" => self.json_format = true,
                "0" | "false" => self.json_format = false,
                _ => {}
            }
        }
        self
    }
}

/// 构建过滤器：优先使用 RUST_LOG，否则只放行本 crate 的指定级别
fn build_env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={}",
            env!("CARGO_PKG_NAME").replace('-', "_"),
            <&str>::from(level)
        ))
    })
}

/// 初始化日志系统
///
/// 返回的 guard 需要在进程生命周期内持有，drop 时会刷新尚未写盘的日志。
pub fn init_logger(config: LogConfig) -> Result<WorkerGuard> {
    // 确保日志目录存在
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = match config.rotation.as_str() {
        "hourly" => rolling::hourly(&config.log_dir, &config.file_prefix),
        _ => rolling::daily(&config.log_dir, &config.file_prefix),
    };
    let (non_blocking_file, guard) = non_blocking(file_appender);

    let env_filter = build_env_filter(config.level);

    let file_layer = if config.json_format {
        fmt::layer()
            .json()
            .with_writer(non_blocking_file)
            .with_timer(ChronoUtc::rfc_3339())
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking_file)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    let console_layer = config.console_output.then(|| {
        fmt::layer()
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    Ok(guard)
}

/// 快速初始化开发环境日志
pub fn init_dev_logger() -> Result<WorkerGuard> {
    let config = LogConfig {
        level: LogLevel::Debug,
        log_dir: "logs".to_string(),
        file_prefix: "dev".to_string(),
        console_output: true,
        json_format: false,
        rotation: "daily".to_string(),
    }
    .with_overrides(|name| std::env::var(name).ok());
    init_logger(config)
}

/// 快速初始化生产环境日志
pub fn init_prod_logger() -> Result<WorkerGuard> {
    let config = LogConfig {
        level: LogLevel::Info,
        log_dir: "/var/log/finchat_gateway".to_string(),
        file_prefix: "app".to_string(),
        console_output: false,
        json_format: true,
        rotation: "daily".to_string(),
    }
    .with_overrides(|name| std::env::var(name).ok());
    init_logger(config)
}
