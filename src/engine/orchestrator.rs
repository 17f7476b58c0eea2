//! # 对话编排器
//!
//! 把一次用户提问变成一次有界的、可重试的、带 Key 轮换和模型降级、支持工具调用的流式交互。
//!
//! 状态流转：
//!
//! ```text
//! Queued → Dispatching → Streaming ⇄ ToolPending → Completing → {Done, Failed}
//! ```
//!
//! - 每次尝试前获取并发闸门许可，尝试结束（成功、失败、取消）即归还；退避等待和工具执行期间不占用名额
//! - 一轮尝试中途失败并且已经向客户端推送过文本时，先发 `restart` 事件，
//!   表示自上一个 `checkpoint`（没有时为开头）以来的输出作废，然后整轮重来
//! - 带文本的工具轮成功后发 `checkpoint`，此前的文本会进入最终答案，不再被 `restart` 作废
//! - 客户端断开（事件流被 drop）会触发取消令牌，所有等待点都会及时退出，
//!   闸门许可、会话锁和上游连接都随之释放

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::engine::error::{ErrorCode, ExchangeError};
use crate::engine::gate::{ConcurrencyGate, GateError, GateStats};
use crate::engine::key_pool::{CredentialStats, KeyOutcome, KeyPool, Unavailable};
use crate::engine::retry::{AttemptOutcome, Decision, RetryPolicy, RetryState};
use crate::engine::session::{ExchangeGuard, Reservation, Role, SessionError, SessionStore, Turn};
use crate::llm_api::provider::{ChatProvider, ProviderChunk, ProviderError, ProviderRequest};
use crate::llm_api::utils::msg_structure::{Message, ToolCallMessage};
use crate::llm_api::utils::tool_structure::ToolDefinition;
use crate::tools::{ToolCall, ToolInvoker};

/// 系统提示词
pub const SYSTEM_INSTRUCTION: &str = "You are a helpful financial assistant that can provide information based on documents, \
market data tools or general knowledge. When answering:
1. If context is provided, prioritize information from the context.
2. If the context doesn't contain the answer but you know it, provide a general answer based on your financial knowledge.
3. Use the available tools for live prices, company overviews, financial statements and recent news.
4. Be concise and clear in your explanations, and format financial data in a readable way.
5. If you're unsure, acknowledge the limitations of your knowledge.
6. If the user asks about a topic that is not related to finance, say that you are not able to answer that question.
Context, when available, is provided between [CONTEXT] tags.";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// 推送给客户端的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// 文本增量
    Delta { text: String },
    /// 之前推送的文本已确定保留
    Checkpoint,
    /// 自上一个 checkpoint（没有时为开头）以来推送的文本作废
    Restart { reason: String },
    /// 正常结束
    Done,
    /// 失败结束
    Error { error: ExchangeError },
}

/// 一次提问
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub session_id: String,
    pub query: String,
    /// 可选的文档内容，会以 `[CONTEXT]` 块附在本次提问前
    pub document_context: Option<String>,
}

impl ExchangeRequest {
    pub fn new(session_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            query: query.into(),
            document_context: None,
        }
    }

    pub fn with_document_context(mut self, context: impl Into<String>) -> Self {
        self.document_context = Some(context.into());
        self
    }

    fn validate(&self) -> Result<(), ExchangeError> {
        if self.session_id.trim().is_empty() {
            return Err(ExchangeError::invalid_request("session_id cannot be empty"));
        }
        if self.query.trim().is_empty() {
            return Err(ExchangeError::invalid_request("query cannot be empty"));
        }
        Ok(())
    }
}

/// 编排器运行参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model_tiers: Vec<String>,
    pub attempt_timeout: Duration,
    pub max_tool_depth: u32,
    pub temperature: Option<f32>,
    pub system_instruction: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            model_tiers: config.provider.model_tiers.clone(),
            attempt_timeout: config.provider.attempt_timeout,
            max_tool_depth: config.tools.max_tool_depth,
            temperature: config.provider.temperature,
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

/// 运行状态快照
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub gate: GateStats,
    pub credentials: Vec<CredentialStats>,
    pub sessions: usize,
    pub model_tiers: Vec<String>,
}

/// 事件流；drop 即视为客户端断开
pub struct EventStream {
    rx: mpsc::Receiver<ChatEvent>,
    _cancel: DropGuard,
}

impl Stream for EventStream {
    type Item = ChatEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChatEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// 单次尝试的失败
#[derive(Debug)]
enum AttemptError {
    RateLimited(String),
    /// 凭证被上游拒绝，计入该凭证的耗尽阈值
    Rejected(String),
    /// 超时、空响应、网络或服务端故障；只影响重试策略，不归咎于凭证
    Hard(String),
    NoCredential(Unavailable),
    Gate(GateError),
    /// 客户端断开或取消
    Aborted,
}

impl AttemptError {
    fn outcome(&self) -> Option<AttemptOutcome> {
        match self {
            AttemptError::RateLimited(_) => Some(AttemptOutcome::RateLimited),
            AttemptError::Rejected(_) | AttemptError::Hard(_) => Some(AttemptOutcome::HardError),
            AttemptError::NoCredential(unavailable) => Some(AttemptOutcome::NoCredential {
                retry_after: unavailable.retry_after,
            }),
            AttemptError::Gate(_) | AttemptError::Aborted => None,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::RateLimited(msg) | AttemptError::Rejected(msg) | AttemptError::Hard(msg) => f.write_str(msg),
            AttemptError::NoCredential(unavailable) => write!(f, "{}", unavailable),
            AttemptError::Gate(gate) => write!(f, "{}", gate),
            AttemptError::Aborted => f.write_str("aborted"),
        }
    }
}

impl From<ProviderError> for AttemptError {
    fn from(error: ProviderError) -> Self {
        if error.is_rate_limited() {
            AttemptError::RateLimited(error.to_string())
        } else if error.is_credential_rejected() {
            AttemptError::Rejected(error.to_string())
        } else {
            AttemptError::Hard(error.to_string())
        }
    }
}

/// 交换终止原因
enum Halt {
    Failed(ExchangeError),
    Aborted,
}

impl From<ExchangeError> for Halt {
    fn from(error: ExchangeError) -> Self {
        Halt::Failed(error)
    }
}

/// 一轮成功尝试的产出
struct RoundOutput {
    text: String,
    tool_calls: Vec<ToolCallMessage>,
}

/// 一次交换的上下文
struct Exchange<'a> {
    id: String,
    session_id: String,
    tx: &'a mpsc::Sender<ChatEvent>,
    cancel: &'a CancellationToken,
}

impl Exchange<'_> {
    async fn emit(&self, event: ChatEvent) -> Result<(), Halt> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Halt::Aborted),
            sent = self.tx.send(event) => sent.map_err(|_| Halt::Aborted),
        }
    }
}

/// 对话编排器
pub struct Orchestrator {
    provider: Arc<dyn ChatProvider>,
    key_pool: Arc<KeyPool>,
    policy: RetryPolicy,
    gate: ConcurrencyGate,
    sessions: SessionStore,
    tools: Arc<ToolInvoker>,
    tool_definitions: Vec<ToolDefinition>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// 按配置装配全部组件
    pub fn new(config: &GatewayConfig, provider: Arc<dyn ChatProvider>, tools: ToolInvoker) -> Self {
        Self::from_parts(
            provider,
            Arc::new(KeyPool::new(&config.key_pool)),
            RetryPolicy::new(config.retry.clone(), config.provider.model_tiers.len()),
            ConcurrencyGate::new(&config.gate),
            SessionStore::new(config.session.policy),
            tools,
            OrchestratorSettings::from_config(config),
        )
    }

    /// 由已构建好的组件装配
    pub fn from_parts(
        provider: Arc<dyn ChatProvider>,
        key_pool: Arc<KeyPool>,
        policy: RetryPolicy,
        gate: ConcurrencyGate,
        sessions: SessionStore,
        tools: ToolInvoker,
        settings: OrchestratorSettings,
    ) -> Self {
        let tool_definitions = tools.definitions();
        info!(
            provider = provider.name(),
            credentials = key_pool.len(),
            tiers = ?settings.model_tiers,
            tools = tool_definitions.len(),
            gate_capacity = gate.capacity(),
            "Orchestrator ready"
        );
        Self {
            provider,
            key_pool,
            policy,
            gate,
            sessions,
            tools: Arc::new(tools),
            tool_definitions,
            settings,
        }
    }

    pub fn key_pool(&self) -> &KeyPool {
        &self.key_pool
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            gate: self.gate.stats(),
            credentials: self.key_pool.stats(),
            sessions: self.sessions.len(),
            model_tiers: self.settings.model_tiers.clone(),
        }
    }

    /// 清空会话历史；不等待进行中的交换
    pub fn clear_session(&self, session_id: &str) -> bool {
        self.sessions.clear(session_id)
    }

    /// 开始一次流式回答
    ///
    /// 交换在后台任务中运行；返回的事件流以 `Done` 或 `Error` 结束。
    pub fn stream_answer(self: &Arc<Self>, request: ExchangeRequest) -> EventStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let exchange_id = Uuid::new_v4().to_string();
        let span = info_span!("exchange", exchange_id = %exchange_id, session_id = %request.session_id);

        // 在启动任务前占好会话中的位置，同一会话按调用顺序执行
        let admission = request.validate().and_then(|()| {
            self.sessions
                .reserve(&request.session_id)
                .map_err(|error| ExchangeError::new(ErrorCode::SessionConflict, error.to_string()))
        });

        let orchestrator = Arc::clone(self);
        let task_cancel = cancel.clone();
        tokio::spawn(
            async move {
                orchestrator.run(exchange_id, request, admission, tx, task_cancel).await;
            }
            .instrument(span),
        );

        EventStream {
            rx,
            _cancel: cancel.drop_guard(),
        }
    }

    /// 非流式回答：收集完整文本
    pub async fn answer(self: &Arc<Self>, request: ExchangeRequest) -> Result<String, ExchangeError> {
        let mut events = self.stream_answer(request);
        let mut answer = String::new();
        let mut kept = 0;
        while let Some(event) = events.next().await {
            match event {
                ChatEvent::Delta { text } => answer.push_str(&text),
                ChatEvent::Checkpoint => kept = answer.len(),
                ChatEvent::Restart { .. } => answer.truncate(kept),
                ChatEvent::Done => return Ok(answer),
                ChatEvent::Error { error } => return Err(error),
            }
        }
        Err(ExchangeError::cancelled())
    }

    async fn run(
        &self,
        id: String,
        request: ExchangeRequest,
        admission: Result<Reservation, ExchangeError>,
        tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) {
        let exchange = Exchange {
            id,
            session_id: request.session_id.clone(),
            tx: &tx,
            cancel: &cancel,
        };

        let outcome = match admission {
            Ok(reservation) => self.run_exchange(&exchange, &request, reservation).await,
            Err(error) => Err(Halt::Failed(error)),
        };

        match outcome {
            Ok(()) => {
                // Done 已在提交历史后发出
            }
            Err(Halt::Failed(error)) => {
                error!(exchange_id = %exchange.id, code = %error.code, error = %error.message, "Exchange failed");
                let _ = exchange.emit(ChatEvent::Error { error }).await;
            }
            Err(Halt::Aborted) => {
                info!(exchange_id = %exchange.id, "Exchange abandoned by client");
            }
        }
    }

    async fn run_exchange(
        &self,
        exchange: &Exchange<'_>,
        request: &ExchangeRequest,
        reservation: Reservation,
    ) -> Result<(), Halt> {
        // Queued: 等待会话
        let guard = reservation
            .wait(exchange.cancel)
            .await
            .map_err(|error| match error {
                SessionError::Conflict { .. } => Halt::Failed(ExchangeError::new(ErrorCode::SessionConflict, error.to_string())),
                SessionError::Cancelled => Halt::Aborted,
            })?;

        let mut conversation = self.build_context(&guard, request);
        let mut new_turns = vec![Turn::user(request.query.clone())];
        let mut answer = String::new();
        let mut retry = RetryState::new();
        let mut depth: u32 = 0;

        loop {
            let round = self.dispatch(exchange, &conversation, &mut retry).await?;
            answer.push_str(&round.text);

            if round.tool_calls.is_empty() {
                break;
            }

            // ToolPending
            if !round.text.is_empty() {
                exchange.emit(ChatEvent::Checkpoint).await?;
            }
            depth += 1;
            if depth > self.settings.max_tool_depth {
                return Err(Halt::Failed(ExchangeError::new(
                    ErrorCode::ToolDepthExceeded,
                    format!("model kept requesting tools beyond depth {}", self.settings.max_tool_depth),
                )));
            }

            let calls: Vec<ToolCall> = round.tool_calls.iter().map(ToolCall::from).collect();
            info!(
                exchange_id = %exchange.id,
                depth,
                tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "Model requested tool calls"
            );
            conversation.push(Message::assistant(round.text).with_tool_calls(round.tool_calls));

            let results = tokio::select! {
                _ = exchange.cancel.cancelled() => return Err(Halt::Aborted),
                results = self.tools.invoke_all(&calls) => results,
            };
            for result in results {
                new_turns.push(Turn::tool(result.name.clone(), result.output.clone()));
                conversation.push(Message::tool(result.output, result.name, result.call_id));
            }
        }

        // Completing
        new_turns.push(Turn::assistant(answer));
        guard.commit(new_turns);
        info!(exchange_id = %exchange.id, tool_depth = depth, attempts = retry.attempts, "Exchange completed");
        exchange.emit(ChatEvent::Done).await
    }

    /// 重建上下文：系统提示、历史、带可选文档块的本次提问
    fn build_context(&self, guard: &ExchangeGuard, request: &ExchangeRequest) -> Vec<Message> {
        let history = guard.history();
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.settings.system_instruction.clone()));

        for turn in history {
            messages.push(match turn.role {
                Role::User => Message::user(turn.content),
                Role::Assistant => Message::assistant(turn.content),
                // 历史中的工具轮次没有对应的 tool_call_id，以助手文本的形式回放
                Role::Tool => Message::assistant(format!(
                    "[{} result]\n{}",
                    turn.name.as_deref().unwrap_or("tool"),
                    turn.content
                )),
            });
        }

        let prompt = match request.document_context.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(context) => format!(
                "[CONTEXT]\n{}\n[/CONTEXT]\nBased on the above context, please answer the following question:\n{}",
                context, request.query
            ),
            None => request.query.clone(),
        };
        messages.push(Message::user(prompt));
        messages
    }

    /// Dispatching/Streaming：反复尝试直到一轮成功，或策略放弃
    async fn dispatch(
        &self,
        exchange: &Exchange<'_>,
        conversation: &[Message],
        retry: &mut RetryState,
    ) -> Result<RoundOutput, Halt> {
        loop {
            if exchange.cancel.is_cancelled() {
                return Err(Halt::Aborted);
            }

            let tier = retry.tier;
            let mut delivered = false;
            let error = match self.attempt(exchange, tier, conversation, &mut delivered).await {
                Ok(round) => {
                    self.policy.decide(retry, AttemptOutcome::Success);
                    return Ok(round);
                }
                Err(error) => error,
            };

            let outcome = match (&error, error.outcome()) {
                (_, Some(outcome)) => outcome,
                (AttemptError::Gate(GateError::Congested { .. }), None) => {
                    return Err(Halt::Failed(ExchangeError::congested(error.to_string())));
                }
                (AttemptError::Gate(GateError::Closed), None) => {
                    return Err(Halt::Failed(ExchangeError::congested(error.to_string())));
                }
                _ => return Err(Halt::Aborted),
            };

            if delivered {
                exchange
                    .emit(ChatEvent::Restart {
                        reason: error.to_string(),
                    })
                    .await?;
            }

            match self.policy.decide(retry, outcome) {
                Decision::Retry { delay, tier, rotate } => {
                    warn!(
                        exchange_id = %exchange.id,
                        tier,
                        rotate,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying attempt"
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = exchange.cancel.cancelled() => return Err(Halt::Aborted),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Decision::Fallback { next_tier } => {
                    warn!(
                        exchange_id = %exchange.id,
                        from_tier = tier,
                        next_tier,
                        model = self.model_for(next_tier),
                        "Falling back to next model tier"
                    );
                }
                Decision::GiveUp { reason } => {
                    return Err(Halt::Failed(reason.into_error(&error.to_string())));
                }
                Decision::Succeed => {}
            }
        }
    }

    fn model_for(&self, tier: usize) -> &str {
        self.settings
            .model_tiers
            .get(tier)
            .or_else(|| self.settings.model_tiers.last())
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// 一次上游尝试
    async fn attempt(
        &self,
        exchange: &Exchange<'_>,
        tier: usize,
        conversation: &[Message],
        delivered: &mut bool,
    ) -> Result<RoundOutput, AttemptError> {
        let _permit = self
            .gate
            .acquire_with_cancel(exchange.cancel)
            .await
            .map_err(|error| match error {
                GateError::Cancelled => AttemptError::Aborted,
                other => AttemptError::Gate(other),
            })?;

        let credential = self.key_pool.acquire(tier).map_err(AttemptError::NoCredential)?;
        let request = ProviderRequest {
            model: self.model_for(tier).to_string(),
            messages: conversation.to_vec(),
            tools: self.tool_definitions.clone(),
            temperature: self.settings.temperature,
        };
        debug!(
            exchange_id = %exchange.id,
            session_id = %exchange.session_id,
            tier,
            model = %request.model,
            credential_id = credential.id(),
            "Dispatching attempt"
        );

        let streaming = async {
            let mut stream = self.provider.open_stream(credential.secret(), &request).await?;
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk? {
                    ProviderChunk::Text(delta) => {
                        text.push_str(&delta);
                        *delivered = true;
                        if exchange.tx.send(ChatEvent::Delta { text: delta }).await.is_err() {
                            return Err(AttemptError::Aborted);
                        }
                    }
                    ProviderChunk::ToolCalls(calls) => tool_calls.extend(calls),
                }
            }
            if text.is_empty() && tool_calls.is_empty() {
                return Err(AttemptError::Hard("model returned an empty response".to_string()));
            }
            Ok::<RoundOutput, AttemptError>(RoundOutput { text, tool_calls })
        };

        let result = tokio::select! {
            _ = exchange.cancel.cancelled() => Err(AttemptError::Aborted),
            timed = tokio::time::timeout(self.settings.attempt_timeout, streaming) => match timed {
                Ok(result) => result,
                Err(_) => Err(AttemptError::Hard(format!(
                    "attempt timed out after {:?}",
                    self.settings.attempt_timeout
                ))),
            },
        };

        let key_outcome = match &result {
            Ok(_) => Some(KeyOutcome::Success),
            Err(AttemptError::RateLimited(_)) => Some(KeyOutcome::RateLimited),
            Err(AttemptError::Rejected(_)) => Some(KeyOutcome::HardError),
            Err(_) => None,
        };
        if let Some(key_outcome) = key_outcome {
            self.key_pool.report(credential.id(), tier, key_outcome);
        }
        match &result {
            Ok(round) => debug!(
                exchange_id = %exchange.id,
                tier,
                credential_id = credential.id(),
                chars = round.text.len(),
                tool_calls = round.tool_calls.len(),
                "Attempt succeeded"
            ),
            Err(error) => warn!(
                exchange_id = %exchange.id,
                tier,
                credential_id = credential.id(),
                error = %error,
                "Attempt failed"
            ),
        }
        result
    }
}
