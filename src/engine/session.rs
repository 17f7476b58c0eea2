//! # 会话存储
//!
//! 每个会话有自己的历史和一把公平互斥锁：
//! - 同一会话的交换按到达顺序串行（tokio Mutex 是 FIFO 的）
//! - 不同会话之间互不等待
//! - `clear` 只清空历史，不等待进行中的交换；之后提交的交换会以自己的轮次重新填充会话
//! - 回收任务只删除空闲且没有交换在进行或排队的会话

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SessionPolicy;

/// 轮次角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// 历史中的一轮
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// 工具轮次对应的工具名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
        }
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: Some(name.into()),
        }
    }
}

/// 会话获取失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// reject 策略下同一会话已有交换在进行
    Conflict { session_id: String },
    /// 排队期间被取消
    Cancelled,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Conflict { session_id } => {
                write!(f, "session '{}' already has an exchange in flight", session_id)
            }
            SessionError::Cancelled => write!(f, "cancelled while waiting for the session"),
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Debug)]
struct SessionEntry {
    turns: Vec<Turn>,
    last_active: Instant,
    lock: Arc<AsyncMutex<()>>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            turns: Vec::new(),
            last_active: Instant::now(),
            lock: Arc::new(AsyncMutex::new(())),
        }
    }
}

#[derive(Debug)]
struct StoreInner {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    policy: SessionPolicy,
}

/// 会话存储，克隆代价很小，所有克隆共享同一份数据
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

/// 持有期间独占一个会话；drop 时释放
#[derive(Debug)]
pub struct ExchangeGuard {
    store: SessionStore,
    session_id: String,
    _lock: OwnedMutexGuard<()>,
}

impl ExchangeGuard {
    fn into_lock(self) -> OwnedMutexGuard<()> {
        self._lock
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 当前历史的快照
    pub fn history(&self) -> Vec<Turn> {
        self.store.snapshot(&self.session_id)
    }

    /// 把一次完成的交换追加到历史
    ///
    /// 会话在交换期间被清空或回收时，这些轮次会重新建立会话。
    pub fn commit(self, turns: Vec<Turn>) {
        let mut sessions = self.store.sessions();
        let entry = sessions
            .entry(self.session_id.clone())
            .or_insert_with(SessionEntry::new);
        let appended = turns.len();
        entry.turns.extend(turns);
        entry.last_active = Instant::now();
        debug!(
            session_id = %self.session_id,
            appended,
            total = entry.turns.len(),
            "Exchange committed to session"
        );
    }
}

/// 已在会话队列中占好位置、尚未轮到的交换
///
/// 位置在 [`SessionStore::reserve`] 返回时就已确定，之后何时开始等待不影响先后顺序；
/// drop 即放弃位置。
pub struct Reservation {
    store: SessionStore,
    session_id: String,
    state: ReservationState,
}

enum ReservationState {
    Ready(OwnedMutexGuard<()>),
    Waiting(BoxFuture<'static, OwnedMutexGuard<()>>),
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = matches!(self.state, ReservationState::Ready(_));
        f.debug_struct("Reservation")
            .field("session_id", &self.session_id)
            .field("ready", &ready)
            .finish()
    }
}

impl Reservation {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 等待轮到自己；等待期间响应取消
    pub async fn wait(self, cancel: &CancellationToken) -> Result<ExchangeGuard, SessionError> {
        let Reservation {
            store,
            session_id,
            state,
        } = self;
        let lock = match state {
            ReservationState::Ready(lock) => lock,
            ReservationState::Waiting(pending) => tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                lock = pending => lock,
            },
        };
        Ok(store.guard(&session_id, lock))
    }
}

impl SessionStore {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                sessions: Mutex::new(HashMap::new()),
                policy,
            }),
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.inner.policy
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 取得会话的锁句柄，不存在时创建会话
    fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut sessions = self.sessions();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionEntry::new);
        entry.last_active = Instant::now();
        entry.lock.clone()
    }

    fn guard(&self, session_id: &str, lock: OwnedMutexGuard<()>) -> ExchangeGuard {
        ExchangeGuard {
            store: self.clone(),
            session_id: session_id.to_string(),
            _lock: lock,
        }
    }

    /// 排队等待独占会话（FIFO）
    pub async fn begin_exchange(&self, session_id: &str) -> ExchangeGuard {
        let lock = self.session_lock(session_id).lock_owned().await;
        self.guard(session_id, lock)
    }

    /// 会话空闲时立即独占，否则返回 Conflict
    pub fn try_begin_exchange(&self, session_id: &str) -> Result<ExchangeGuard, SessionError> {
        match self.session_lock(session_id).try_lock_owned() {
            Ok(lock) => Ok(self.guard(session_id, lock)),
            Err(_) => Err(SessionError::Conflict {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// 立即在会话队列中占位，不等待
    ///
    /// 排队策略下返回的占位按调用顺序获得会话；reject 策略下会话忙时直接返回 Conflict。
    pub fn reserve(&self, session_id: &str) -> Result<Reservation, SessionError> {
        let state = match self.inner.policy {
            SessionPolicy::Reject => ReservationState::Ready(self.try_begin_exchange(session_id)?.into_lock()),
            SessionPolicy::Queue => {
                let mut pending = self.session_lock(session_id).lock_owned().boxed();
                // 第一次 poll 把等待者挂进 FIFO 队列；之后由真正的任务继续 poll
                let mut cx = Context::from_waker(futures::task::noop_waker_ref());
                match pending.poll_unpin(&mut cx) {
                    Poll::Ready(lock) => ReservationState::Ready(lock),
                    Poll::Pending => ReservationState::Waiting(pending),
                }
            }
        };
        Ok(Reservation {
            store: self.clone(),
            session_id: session_id.to_string(),
            state,
        })
    }

    /// 按配置的策略独占会话；排队时响应取消
    pub async fn acquire(&self, session_id: &str, cancel: &CancellationToken) -> Result<ExchangeGuard, SessionError> {
        self.reserve(session_id)?.wait(cancel).await
    }

    /// 在独占会话的前提下访问并修改历史
    pub async fn with_session<F, T>(&self, session_id: &str, f: F) -> T
    where
        F: FnOnce(&mut Vec<Turn>) -> T,
    {
        let _guard = self.begin_exchange(session_id).await;
        let mut sessions = self.sessions();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionEntry::new);
        entry.last_active = Instant::now();
        f(&mut entry.turns)
    }

    /// 历史快照；会话不存在时返回空
    pub fn snapshot(&self, session_id: &str) -> Vec<Turn> {
        self.sessions()
            .get(session_id)
            .map(|entry| entry.turns.clone())
            .unwrap_or_default()
    }

    /// 清空历史；幂等，不等待进行中的交换
    ///
    /// 返回清空前是否有历史。
    pub fn clear(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions();
        let had_turns = match sessions.get_mut(session_id) {
            Some(entry) => {
                let had_turns = !entry.turns.is_empty();
                entry.turns.clear();
                entry.last_active = Instant::now();
                had_turns
            }
            None => false,
        };
        info!(session_id, had_turns, "Session cleared");
        had_turns
    }

    /// 删除空闲超过 `max_idle` 且没有交换在进行或排队的会话，返回删除数量
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, entry| {
            let idle = now.saturating_duration_since(entry.last_active) >= max_idle;
            let in_use = Arc::strong_count(&entry.lock) > 1;
            !idle || in_use
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = sessions.len(), "Idle sessions evicted");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
