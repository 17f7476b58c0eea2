//! # 重试与降级策略测试集
//!
//! - 退避延迟单调递增且不超过上限（含抖动）
//! - 限流立即轮换凭证，达到阈值后降级
//! - 硬错误有限次重试后降级，最后一层失败后放弃
//! - 凭证冷却 / 耗尽时的等待与放弃

use finchat_gateway::config::{BackoffConfig, RetryConfig};
use finchat_gateway::engine::{AttemptOutcome, Decision, ErrorCode, GiveUpReason, RetryPolicy, RetryState};
use std::time::Duration;

fn create_policy(tiers: usize, jitter: f64) -> RetryPolicy {
    RetryPolicy::new(
        RetryConfig {
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(200),
                multiplier: 2.0,
                max_delay: Duration::from_secs(2),
                jitter,
            },
            tier_failure_threshold: 3,
            max_hard_retries: 2,
        },
        tiers,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== 退避 ==========

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        println!("=== Testing backoff monotonicity ===");
        let policy = create_policy(1, 0.0);
        let delays: Vec<Duration> = (0..10).map(|n| policy.base_delay_for(n)).collect();
        println!("delays: {:?}", delays);

        assert_eq!(delays[0], Duration::from_millis(200));
        assert_eq!(delays[1], Duration::from_millis(400));
        assert_eq!(delays[2], Duration::from_millis(800));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
        assert_eq!(delays[9], Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        println!("=== Testing jitter bounds ===");
        let policy = create_policy(1, 1.0);
        for retry in 0..8 {
            let base = policy.base_delay_for(retry);
            for _ in 0..50 {
                let delay = policy.delay_for(retry);
                assert!(delay >= base);
                assert!(delay <= Duration::from_secs(2));
                assert!(delay <= base * 2);
            }
        }
    }

    // ========== 决策 ==========

    #[test]
    fn test_rate_limits_rotate_then_fall_back() {
        println!("=== Testing rate limit rotation and fallback ===");
        let policy = create_policy(2, 0.0);
        let mut state = RetryState::new();

        for _ in 0..2 {
            assert_eq!(
                policy.decide(&mut state, AttemptOutcome::RateLimited),
                Decision::Retry {
                    delay: Duration::ZERO,
                    tier: 0,
                    rotate: true
                }
            );
        }
        assert_eq!(
            policy.decide(&mut state, AttemptOutcome::RateLimited),
            Decision::Fallback { next_tier: 1 }
        );
        assert_eq!(state.tier, 1);
        assert_eq!(state.tier_failures, 0);

        for _ in 0..2 {
            policy.decide(&mut state, AttemptOutcome::RateLimited);
        }
        let decision = policy.decide(&mut state, AttemptOutcome::RateLimited);
        assert_eq!(
            decision,
            Decision::GiveUp {
                reason: GiveUpReason::RateLimited
            }
        );
        assert_eq!(state.attempts, 6);
    }

    #[test]
    fn test_hard_errors_back_off_then_fall_back() {
        println!("=== Testing hard error retries ===");
        let policy = create_policy(2, 0.0);
        let mut state = RetryState::new();

        assert_eq!(
            policy.decide(&mut state, AttemptOutcome::HardError),
            Decision::Retry {
                delay: Duration::from_millis(200),
                tier: 0,
                rotate: false
            }
        );
        assert_eq!(
            policy.decide(&mut state, AttemptOutcome::HardError),
            Decision::Retry {
                delay: Duration::from_millis(400),
                tier: 0,
                rotate: false
            }
        );
        assert_eq!(
            policy.decide(&mut state, AttemptOutcome::HardError),
            Decision::Fallback { next_tier: 1 }
        );
    }

    #[test]
    fn test_success_resets_tier_counters() {
        let policy = create_policy(2, 0.0);
        let mut state = RetryState::new();
        policy.decide(&mut state, AttemptOutcome::HardError);
        policy.decide(&mut state, AttemptOutcome::RateLimited);
        assert_eq!(policy.decide(&mut state, AttemptOutcome::Success), Decision::Succeed);
        assert_eq!(state.tier_failures, 0);
        assert_eq!(state.hard_errors, 0);
        assert_eq!(state.tier, 0);
    }

    #[test]
    fn test_single_tier_gives_up_as_upstream_failure() {
        let policy = create_policy(1, 0.0);
        let mut state = RetryState::new();
        policy.decide(&mut state, AttemptOutcome::HardError);
        policy.decide(&mut state, AttemptOutcome::HardError);
        let decision = policy.decide(&mut state, AttemptOutcome::HardError);
        let Decision::GiveUp { reason } = decision else {
            panic!("expected give up, got {:?}", decision);
        };
        assert_eq!(reason.code(), ErrorCode::TransientUpstreamError);
    }

    #[test]
    fn test_no_credential_waits_for_cooldown() {
        println!("=== Testing wait on cooling pool ===");
        let policy = create_policy(1, 0.0);
        let mut state = RetryState::new();

        // 冷却剩余时间大于退避时，以冷却为准
        let decision = policy.decide(
            &mut state,
            AttemptOutcome::NoCredential {
                retry_after: Some(Duration::from_millis(1500)),
            },
        );
        assert_eq!(
            decision,
            Decision::Retry {
                delay: Duration::from_millis(1500),
                tier: 0,
                rotate: false
            }
        );

        // 不会超过上限
        let decision = policy.decide(
            &mut state,
            AttemptOutcome::NoCredential {
                retry_after: Some(Duration::from_secs(600)),
            },
        );
        assert_eq!(
            decision,
            Decision::Retry {
                delay: Duration::from_secs(2),
                tier: 0,
                rotate: false
            }
        );

        let decision = policy.decide(
            &mut state,
            AttemptOutcome::NoCredential {
                retry_after: Some(Duration::from_secs(1)),
            },
        );
        assert_eq!(
            decision,
            Decision::GiveUp {
                reason: GiveUpReason::Exhausted
            }
        );
    }

    #[test]
    fn test_exhausted_pool_gives_up_immediately() {
        let policy = create_policy(3, 0.0);
        let mut state = RetryState::new();
        let decision = policy.decide(&mut state, AttemptOutcome::NoCredential { retry_after: None });
        assert_eq!(
            decision,
            Decision::GiveUp {
                reason: GiveUpReason::Exhausted
            }
        );
        let error = GiveUpReason::Exhausted.into_error("all credentials exhausted");
        assert_eq!(error.code, ErrorCode::Exhausted);
        assert_eq!(error.code.as_str(), "exhausted");
    }
}
