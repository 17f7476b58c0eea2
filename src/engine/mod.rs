//! # 流式对话编排引擎
//!
//! 由叶子到根：Key Pool → 重试策略 → 并发闸门 → 会话存储 → 编排器。
//! 工具调用器在 `crate::tools` 中。

pub mod error;
pub mod gate;
pub mod key_pool;
pub mod orchestrator;
pub mod retry;
pub mod session;

pub use error::{ErrorCode, ExchangeError};
pub use gate::{ConcurrencyGate, GateError, GatePermit, GateStats};
pub use key_pool::{Credential, CredentialState, KeyOutcome, KeyPool, Unavailable};
pub use orchestrator::{ChatEvent, EventStream, ExchangeRequest, Orchestrator, OrchestratorSettings, OrchestratorStats};
pub use retry::{AttemptOutcome, Decision, GiveUpReason, RetryPolicy, RetryState};
pub use session::{ExchangeGuard, Reservation, Role, SessionError, SessionStore, Turn};
