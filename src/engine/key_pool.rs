//! # Key Pool
//!
//! 持有全部供应商凭证及其冷却状态。
//!
//! - 冷却状态按模型层级分别记录：同一个 Key 在主模型上被限流，不影响它在备用模型上被选中
//! - `exhausted` 是凭证级别的：连续硬错误达到阈值后，任何层级都不再选中，直到手动 `reset`
//! - 每个层级有独立的轮询游标
//!
//! 所有状态迁移都在同一把锁内完成，锁内不做任何 await。

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::KeyPoolConfig;

/// 凭证在某个层级上的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Available,
    CoolingDown,
    Exhausted,
}

/// 一次尝试的结果，由编排器回报给 Key Pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Success,
    RateLimited,
    /// 可归咎于凭证的硬错误（如 401/403），连续达到阈值后凭证耗尽
    HardError,
}

/// 选中的凭证
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    id: String,
    secret: String,
}

impl Credential {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

// secret 不能出现在日志里
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential").field("id", &self.id).finish()
    }
}

/// 当前层级没有可用凭证
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unavailable {
    /// 最早一个冷却结束的剩余时间；所有凭证都已 exhausted 时为 None
    pub retry_after: Option<Duration>,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after {
            Some(wait) => write!(f, "all credentials cooling down, earliest available in {:?}", wait),
            None => write!(f, "all credentials exhausted"),
        }
    }
}

impl std::error::Error for Unavailable {}

#[derive(Debug, Clone, Default)]
struct TierState {
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
}

#[derive(Debug)]
struct Entry {
    id: String,
    secret: String,
    exhausted: bool,
    hard_errors: u32,
    usage_count: u64,
    tiers: HashMap<usize, TierState>,
}

impl Entry {
    fn tier_state(&self, tier: usize, now: Instant) -> CredentialState {
        if self.exhausted {
            return CredentialState::Exhausted;
        }
        match self.tiers.get(&tier).and_then(|t| t.cooldown_until) {
            Some(until) if until > now => CredentialState::CoolingDown,
            _ => CredentialState::Available,
        }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: Vec<Entry>,
    cursors: HashMap<usize, usize>,
}

/// 单个凭证在某个层级上的统计
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: usize,
    pub state: CredentialState,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

/// 单个凭证的统计快照
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
    pub id: String,
    pub exhausted: bool,
    pub usage_count: u64,
    pub hard_errors: u32,
    pub tiers: Vec<TierStats>,
}

/// 凭证池
#[derive(Debug)]
pub struct KeyPool {
    inner: Mutex<PoolInner>,
    cooldown_base: Duration,
    cooldown_max: Duration,
    hard_error_threshold: u32,
}

/// 根据 secret 生成不可逆的凭证 ID
pub fn credential_id(secret: &str) -> String {
    let mut hasher = Sha256::default();
    hasher.update(secret.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("key-{}", &digest[..8])
}

impl KeyPool {
    pub fn new(config: &KeyPoolConfig) -> Self {
        let mut entries: Vec<Entry> = Vec::with_capacity(config.api_keys.len());
        for secret in &config.api_keys {
            let id = credential_id(secret);
            if entries.iter().any(|e| e.id == id) {
                warn!(credential_id = %id, "Duplicate API key ignored");
                continue;
            }
            entries.push(Entry {
                id,
                secret: secret.clone(),
                exhausted: false,
                hard_errors: 0,
                usage_count: 0,
                tiers: HashMap::new(),
            });
        }
        info!(credentials = entries.len(), "Key pool initialised");

        Self {
            inner: Mutex::new(PoolInner {
                entries,
                cursors: HashMap::new(),
            }),
            cooldown_base: config.cooldown_base,
            cooldown_max: config.cooldown_max,
            hard_error_threshold: config.hard_error_threshold.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 第 n 次限流（从 0 开始）对应的冷却时长
    pub fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_failures.min(16));
        self.cooldown_base.saturating_mul(factor).min(self.cooldown_max)
    }

    /// 为指定层级选出一个凭证
    pub fn acquire(&self, tier: usize) -> Result<Credential, Unavailable> {
        let now = Instant::now();
        let mut inner = self.lock();
        let count = inner.entries.len();

        // 冷却已结束的先恢复为 available
        for entry in inner.entries.iter_mut().filter(|e| !e.exhausted) {
            if let Some(state) = entry.tiers.get_mut(&tier) {
                if matches!(state.cooldown_until, Some(until) if until <= now) {
                    state.cooldown_until = None;
                    debug!(credential_id = %entry.id, tier, "Credential cooldown elapsed");
                }
            }
        }

        let start = inner.cursors.get(&tier).copied().unwrap_or(0);
        for offset in 0..count {
            let index = (start + offset) % count;
            if inner.entries[index].tier_state(tier, now) != CredentialState::Available {
                continue;
            }
            inner.cursors.insert(tier, (index + 1) % count);
            let entry = &mut inner.entries[index];
            entry.usage_count += 1;
            debug!(credential_id = %entry.id, tier, "Credential selected");
            return Ok(Credential {
                id: entry.id.clone(),
                secret: entry.secret.clone(),
            });
        }

        let retry_after = inner
            .entries
            .iter()
            .filter(|e| !e.exhausted)
            .filter_map(|e| e.tiers.get(&tier).and_then(|t| t.cooldown_until))
            .min()
            .map(|until| until.saturating_duration_since(now));
        warn!(
            tier,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "No credential available"
        );
        Err(Unavailable { retry_after })
    }

    /// 回报一次尝试的结果
    ///
    /// 返回 false 表示凭证 ID 不存在。
    pub fn report(&self, credential_id: &str, tier: usize, outcome: KeyOutcome) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let Some(entry) = inner.entries.iter_mut().find(|e| e.id == credential_id) else {
            warn!(credential_id, "Outcome reported for unknown credential");
            return false;
        };

        match outcome {
            KeyOutcome::Success => {
                entry.hard_errors = 0;
                let state = entry.tiers.entry(tier).or_default();
                state.consecutive_failures = 0;
                state.cooldown_until = None;
            }
            KeyOutcome::RateLimited => {
                let failures = entry.tiers.get(&tier).map(|t| t.consecutive_failures).unwrap_or(0);
                let cooldown = self.cooldown_for(failures);
                let state = entry.tiers.entry(tier).or_default();
                state.cooldown_until = Some(now + cooldown);
                state.consecutive_failures = failures + 1;
                warn!(
                    credential_id,
                    tier,
                    consecutive_failures = state.consecutive_failures,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Credential rate limited, cooling down"
                );
            }
            KeyOutcome::HardError => {
                entry.hard_errors += 1;
                if entry.hard_errors >= self.hard_error_threshold && !entry.exhausted {
                    entry.exhausted = true;
                    warn!(
                        credential_id,
                        hard_errors = entry.hard_errors,
                        "Credential exhausted after repeated hard errors"
                    );
                } else {
                    debug!(credential_id, tier, hard_errors = entry.hard_errors, "Hard error recorded");
                }
            }
        }
        true
    }

    /// 手动恢复一个凭证：清除 exhausted 标记和所有层级的冷却状态
    pub fn reset(&self, credential_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.entries.iter_mut().find(|e| e.id == credential_id) {
            Some(entry) => {
                entry.exhausted = false;
                entry.hard_errors = 0;
                entry.tiers.clear();
                info!(credential_id, "Credential reset");
                true
            }
            None => false,
        }
    }

    /// 指定凭证在指定层级上的当前状态
    pub fn state_of(&self, credential_id: &str, tier: usize) -> Option<CredentialState> {
        let now = Instant::now();
        self.lock()
            .entries
            .iter()
            .find(|e| e.id == credential_id)
            .map(|e| e.tier_state(tier, now))
    }

    /// 全部凭证的统计快照
    pub fn stats(&self) -> Vec<CredentialStats> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .entries
            .iter()
            .map(|entry| {
                let mut tiers: Vec<TierStats> = entry
                    .tiers
                    .iter()
                    .map(|(tier, state)| TierStats {
                        tier: *tier,
                        state: entry.tier_state(*tier, now),
                        consecutive_failures: state.consecutive_failures,
                        cooldown_remaining_ms: state
                            .cooldown_until
                            .filter(|until| *until > now)
                            .map(|until| (until - now).as_millis() as u64),
                    })
                    .collect();
                tiers.sort_by_key(|t| t.tier);
                CredentialStats {
                    id: entry.id.clone(),
                    exhausted: entry.exhausted,
                    usage_count: entry.usage_count,
                    hard_errors: entry.hard_errors,
                    tiers,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(keys: &[&str]) -> KeyPool {
        KeyPool::new(&KeyPoolConfig {
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            cooldown_base: Duration::from_secs(10),
            cooldown_max: Duration::from_secs(60),
            hard_error_threshold: 2,
        })
    }

    #[test]
    fn test_credential_id_hides_secret() {
        let id = credential_id("sk-very-secret");
        assert!(id.starts_with("key-"));
        assert_eq!(id.len(), 12);
        assert!(!id.contains("secret"));
    }

    #[test]
    fn test_debug_does_not_print_secret() {
        let pool = pool(&["sk-very-secret"]);
        let credential = pool.acquire(0).unwrap();
        assert!(!format!("{:?}", credential).contains("sk-very-secret"));
    }

    #[test]
    fn test_cooldown_grows_and_caps() {
        let pool = pool(&["a"]);
        assert_eq!(pool.cooldown_for(0), Duration::from_secs(10));
        assert_eq!(pool.cooldown_for(1), Duration::from_secs(20));
        assert_eq!(pool.cooldown_for(2), Duration::from_secs(40));
        assert_eq!(pool.cooldown_for(3), Duration::from_secs(60));
        assert_eq!(pool.cooldown_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_duplicate_keys_are_collapsed() {
        let pool = pool(&["a", "a", "b"]);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_per_tier() {
        let pool = pool(&["a"]);
        let credential = pool.acquire(0).unwrap();
        pool.report(credential.id(), 0, KeyOutcome::RateLimited);

        assert!(pool.acquire(0).is_err());
        assert_eq!(pool.acquire(1).unwrap().id(), credential.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_errors_exhaust_across_tiers() {
        let pool = pool(&["a"]);
        let credential = pool.acquire(0).unwrap();
        pool.report(credential.id(), 0, KeyOutcome::HardError);
        pool.report(credential.id(), 0, KeyOutcome::HardError);

        assert_eq!(pool.state_of(credential.id(), 1), Some(CredentialState::Exhausted));
        assert_eq!(pool.acquire(1), Err(Unavailable { retry_after: None }));

        assert!(pool.reset(credential.id()));
        assert!(pool.acquire(1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_hard_error_streak() {
        let pool = pool(&["a"]);
        let credential = pool.acquire(0).unwrap();
        pool.report(credential.id(), 0, KeyOutcome::HardError);
        pool.report(credential.id(), 0, KeyOutcome::Success);
        pool.report(credential.id(), 0, KeyOutcome::HardError);
        assert_eq!(pool.state_of(credential.id(), 0), Some(CredentialState::Available));
    }

    #[test]
    fn test_unknown_credential_report() {
        let pool = pool(&["a"]);
        assert!(!pool.report("key-00000000", 0, KeyOutcome::Success));
    }
}
