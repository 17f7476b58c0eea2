//! # 并发闸门
//!
//! 全进程共享的公平（FIFO）计数信号量，限制同时进行的上游模型调用数。
//! 许可随 `GatePermit` 一起 drop，任何退出路径都会归还。

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GateConfig;

/// 获取许可失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// 等待超时
    Congested { waited: Duration },
    /// 等待期间请求被取消
    Cancelled,
    /// 闸门已关闭（进程退出中）
    Closed,
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::Congested { waited } => write!(f, "no upstream slot freed within {:?}", waited),
            GateError::Cancelled => write!(f, "cancelled while waiting for an upstream slot"),
            GateError::Closed => write!(f, "concurrency gate closed"),
        }
    }
}

impl std::error::Error for GateError {}

/// 闸门统计
#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub capacity: usize,
    pub in_flight: usize,
    pub available: usize,
    pub peak_in_flight: usize,
}

#[derive(Debug)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// 持有期间占用一个上游调用名额
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 并发闸门
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    capacity: usize,
    acquire_timeout: Duration,
}

impl ConcurrencyGate {
    pub fn new(config: &GateConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(Counters {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
            capacity,
            acquire_timeout: config.acquire_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 等待一个许可，最多等待配置的超时时间
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        self.acquire_with_cancel(&CancellationToken::new()).await
    }

    /// 等待一个许可，同时响应取消
    pub async fn acquire_with_cancel(&self, cancel: &CancellationToken) -> Result<GatePermit, GateError> {
        let wait = tokio::time::timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned());

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(GateError::Cancelled),
            result = wait => match result {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(GateError::Closed),
                Err(_) => {
                    warn!(
                        capacity = self.capacity,
                        timeout_ms = self.acquire_timeout.as_millis() as u64,
                        "Concurrency gate wait timed out"
                    );
                    return Err(GateError::Congested { waited: self.acquire_timeout });
                }
            },
        };

        let in_flight = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(in_flight, Ordering::SeqCst);
        debug!(in_flight, capacity = self.capacity, "Gate permit acquired");

        Ok(GatePermit {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            capacity: self.capacity,
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            available: self.semaphore.available_permits(),
            peak_in_flight: self.counters.peak.load(Ordering::SeqCst),
        }
    }

    /// 关闭闸门，所有等待者立即收到 Closed
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(capacity: usize, timeout_ms: u64) -> ConcurrencyGate {
        ConcurrencyGate::new(&GateConfig {
            capacity,
            acquire_timeout: Duration::from_millis(timeout_ms),
        })
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let gate = gate(1, 50);
        let permit = gate.acquire().await.unwrap();
        assert_eq!(gate.stats().in_flight, 1);
        drop(permit);
        assert_eq!(gate.stats().in_flight, 0);
        assert_eq!(gate.stats().available, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_as_congested() {
        let gate = gate(1, 50);
        let _held = gate.acquire().await.unwrap();
        let err = gate.acquire().await.unwrap_err();
        assert!(matches!(err, GateError::Congested { .. }));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let gate = gate(1, 10_000);
        let _held = gate.acquire().await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(gate.acquire_with_cancel(&token).await.unwrap_err(), GateError::Cancelled);
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = gate(1, 10_000);
        gate.close();
        assert_eq!(gate.acquire().await.unwrap_err(), GateError::Closed);
    }
}
