//! # 重试与模型降级策略
//!
//! 纯决策逻辑：输入一次尝试的结果和当前计数，输出下一步动作。
//! 真正的等待、换 Key、换模型都由编排器执行。
//!
//! 规则：
//! - 限流：立即换 Key 重试（零延迟），Key Pool 会跳过冷却中的凭证
//! - 硬错误：同一层级上按指数退避重试，最多 `max_hard_retries` 次
//! - 没有可用凭证：至少等到最早的冷却结束（不超过退避上限）再试
//! - 任何失败都计入当前层级的连续失败数，达到阈值就降级到下一个模型；
//!   最后一个层级也失败时放弃

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{BackoffConfig, RetryConfig};
use crate::engine::error::{ErrorCode, ExchangeError};

/// 一次尝试（或尝试前的选 Key）的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    HardError,
    /// Key Pool 返回 Unavailable
    NoCredential { retry_after: Option<Duration> },
}

/// 放弃的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// 最后一次失败是限流
    RateLimited,
    /// 最后一次失败是硬错误
    UpstreamFailure,
    /// 所有凭证都已 exhausted，或者冷却始终没有结束
    Exhausted,
}

impl GiveUpReason {
    pub fn code(&self) -> ErrorCode {
        match self {
            GiveUpReason::RateLimited => ErrorCode::RateLimited,
            GiveUpReason::UpstreamFailure => ErrorCode::TransientUpstreamError,
            GiveUpReason::Exhausted => ErrorCode::Exhausted,
        }
    }

    pub fn into_error(self, last_error: &str) -> ExchangeError {
        let message = match self {
            GiveUpReason::RateLimited => format!("all model tiers rate limited: {}", last_error),
            GiveUpReason::UpstreamFailure => format!("upstream failed on every model tier: {}", last_error),
            GiveUpReason::Exhausted => format!("no usable credential: {}", last_error),
        };
        ExchangeError::new(self.code(), message)
    }
}

/// 策略给出的下一步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// 在 `tier` 上等待 `delay` 后重试；凭证在下一次分派时由 Key Pool 轮询选出，
    /// `rotate` 为 true 时上一次的凭证已进入冷却，必然换成另一个
    Retry { delay: Duration, tier: usize, rotate: bool },
    /// 降级到下一个模型层级，立即分派
    Fallback { next_tier: usize },
    GiveUp { reason: GiveUpReason },
    Succeed,
}

/// 单次对话交换内的重试计数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// 当前模型层级
    pub tier: usize,
    /// 当前层级上的连续失败数
    pub tier_failures: u32,
    /// 当前层级上的硬错误数
    pub hard_errors: u32,
    /// 到目前为止的总尝试数
    pub attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    tier_count: usize,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, tier_count: usize) -> Self {
        Self {
            config,
            tier_count: tier_count.max(1),
        }
    }

    pub fn tier_count(&self) -> usize {
        self.tier_count
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.config.backoff
    }

    /// 第 n 次重试（从 0 开始）的确定性延迟：base × factor^n，不超过上限
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let backoff = &self.config.backoff;
        let factor = backoff.multiplier.max(1.0).powi(retry.min(64) as i32);
        let millis = backoff.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(backoff.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// 第 n 次重试的实际延迟：确定性延迟加上按比例的随机抖动，整体仍不超过上限
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_for(retry);
        let jitter = self.config.backoff.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let max_extra = base.as_millis() as f64 * jitter;
        let extra = rand::thread_rng().gen_range(0.0..=max_extra);
        (base + Duration::from_millis(extra as u64)).min(self.config.backoff.max_delay)
    }

    /// 根据结果更新计数并给出下一步动作
    pub fn decide(&self, state: &mut RetryState, outcome: AttemptOutcome) -> Decision {
        state.attempts += 1;
        let decision = match outcome {
            AttemptOutcome::Success => {
                state.tier_failures = 0;
                state.hard_errors = 0;
                Decision::Succeed
            }
            AttemptOutcome::RateLimited => {
                state.tier_failures += 1;
                if state.tier_failures >= self.config.tier_failure_threshold {
                    self.fall_back(state, GiveUpReason::RateLimited)
                } else {
                    Decision::Retry {
                        delay: Duration::ZERO,
                        tier: state.tier,
                        rotate: true,
                    }
                }
            }
            AttemptOutcome::HardError => {
                state.tier_failures += 1;
                state.hard_errors += 1;
                if state.hard_errors > self.config.max_hard_retries
                    || state.tier_failures >= self.config.tier_failure_threshold
                {
                    self.fall_back(state, GiveUpReason::UpstreamFailure)
                } else {
                    Decision::Retry {
                        delay: self.delay_for(state.hard_errors - 1),
                        tier: state.tier,
                        rotate: false,
                    }
                }
            }
            AttemptOutcome::NoCredential { retry_after: None } => Decision::GiveUp {
                reason: GiveUpReason::Exhausted,
            },
            AttemptOutcome::NoCredential {
                retry_after: Some(wait),
            } => {
                state.tier_failures += 1;
                if state.tier_failures >= self.config.tier_failure_threshold {
                    self.fall_back(state, GiveUpReason::Exhausted)
                } else {
                    let delay = self
                        .delay_for(state.tier_failures - 1)
                        .max(wait)
                        .min(self.config.backoff.max_delay);
                    Decision::Retry {
                        delay,
                        tier: state.tier,
                        rotate: false,
                    }
                }
            }
        };

        debug!(
            tier = state.tier,
            tier_failures = state.tier_failures,
            attempts = state.attempts,
            ?outcome,
            ?decision,
            "Retry decision"
        );
        decision
    }

    fn fall_back(&self, state: &mut RetryState, reason: GiveUpReason) -> Decision {
        if state.tier + 1 < self.tier_count {
            state.tier += 1;
            state.tier_failures = 0;
            state.hard_errors = 0;
            warn!(next_tier = state.tier, "Falling back to next model tier");
            Decision::Fallback { next_tier: state.tier }
        } else {
            warn!(tier = state.tier, ?reason, "Last model tier failed, giving up");
            Decision::GiveUp { reason }
        }
    }
}
