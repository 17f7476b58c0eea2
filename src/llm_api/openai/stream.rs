//! # OpenAI 兼容流式响应解码
//!
//! 上游以 `data: {...}` 行的形式推送增量，以 `data: [DONE]` 结束。
//! 网络分包可能在任意字节处切断一行，所以解码器先按字节缓冲，凑齐整行再解析。
//! 工具调用的参数分散在多个增量里，按 `index` 累积，在 `finish_reason` 出现或流结束时一次性产出。

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use tracing::debug;
use uuid::Uuid;

use crate::llm_api::provider::{ChunkStream, ProviderChunk, ProviderError};
use crate::llm_api::utils::msg_structure::{FunctionCall, ToolCallMessage};

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default, Debug)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// SSE 行解码器
#[derive(Default, Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已经收到 `[DONE]`
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// 喂入一段字节，返回其中完整行解析出的片段
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ProviderChunk>, ProviderError> {
        let mut out = Vec::new();
        if self.done {
            return Ok(out);
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line, &mut out)?;
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        Ok(out)
    }

    /// 上游关闭连接时调用：处理残留的半行，并产出尚未提交的工具调用
    pub fn finish(&mut self) -> Result<Vec<ProviderChunk>, ProviderError> {
        let mut out = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line, &mut out)?;
        }
        self.flush_tool_calls(&mut out);
        self.done = true;
        Ok(out)
    }

    fn process_line(&mut self, raw: &[u8], out: &mut Vec<ProviderChunk>) -> Result<(), ProviderError> {
        let line = std::str::from_utf8(raw)
            .map_err(|e| ProviderError::Protocol {
                message: format!("invalid utf-8 in stream: {}", e),
            })?
            .trim();

        let Some(payload) = line.strip_prefix("data:") else {
            // 空行、注释行（": keep-alive"）和 event: 行都忽略
            return Ok(());
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(());
        }
        if payload == "[DONE]" {
            self.flush_tool_calls(out);
            self.done = true;
            return Ok(());
        }

        let chunk: StreamChunk = serde_json::from_str(payload).map_err(|e| ProviderError::Protocol {
            message: format!("{}: {}", e, payload),
        })?;

        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            let status = error.get("code").and_then(|v| v.as_u64()).map(|c| c as u16);
            return Err(if status == Some(429) {
                ProviderError::RateLimited {
                    retry_after: None,
                    message,
                }
            } else {
                ProviderError::Upstream { status, message }
            });
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    out.push(ProviderChunk::Text(text));
                }
                for call in delta.tool_calls.unwrap_or_default() {
                    // 没有 index 的片段：带 id 的开启新调用，否则续接最后一个
                    let index = match (call.index, call.id.as_deref().filter(|id| !id.is_empty())) {
                        (Some(index), _) => index,
                        (None, Some(_)) => self.tool_calls.keys().next_back().map_or(0, |last| last + 1),
                        (None, None) => self.tool_calls.keys().next_back().copied().unwrap_or(0),
                    };
                    let entry = self.tool_calls.entry(index).or_default();
                    if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                        entry.id = id;
                    }
                    if let Some(function) = call.function {
                        if let Some(name) = function.name {
                            entry.name.push_str(&name);
                        }
                        if let Some(arguments) = function.arguments {
                            entry.arguments.push_str(&arguments);
                        }
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.flush_tool_calls(out);
            }
        }
        Ok(())
    }

    fn flush_tool_calls(&mut self, out: &mut Vec<ProviderChunk>) {
        if self.tool_calls.is_empty() {
            return;
        }
        let calls: Vec<ToolCallMessage> = std::mem::take(&mut self.tool_calls)
            .into_values()
            .filter(|partial| !partial.name.is_empty())
            .map(|partial| ToolCallMessage {
                id: if partial.id.is_empty() {
                    format!("call_{}", Uuid::new_v4().simple())
                } else {
                    partial.id
                },
                tool_type: "function".to_string(),
                function: FunctionCall {
                    name: partial.name,
                    arguments: if partial.arguments.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        partial.arguments
                    },
                },
            })
            .collect();
        if !calls.is_empty() {
            debug!(count = calls.len(), "Assembled tool calls from stream");
            out.push(ProviderChunk::ToolCalls(calls));
        }
    }
}

struct DecodeState<S> {
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<ProviderChunk>,
    finished: bool,
}

/// 把原始字节流转换成片段流
///
/// 字节流的错误视为上游错误；收到 `[DONE]` 后不再读取剩余字节。
pub fn decode_stream<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Some((Ok(chunk), state));
            }
            if state.finished {
                return None;
            }

            let decoded = match state.body.next().await {
                Some(Ok(bytes)) => state.decoder.feed(bytes.as_ref()),
                Some(Err(error)) => {
                    state.finished = true;
                    let error = ProviderError::Upstream {
                        status: None,
                        message: format!("stream interrupted: {}", error),
                    };
                    return Some((Err(error), state));
                }
                None => {
                    state.finished = true;
                    state.decoder.finish()
                }
            };

            match decoded {
                Ok(chunks) => state.pending.extend(chunks),
                Err(error) => {
                    state.finished = true;
                    return Some((Err(error), state));
                }
            }
            if state.decoder.is_done() {
                state.finished = true;
            }
        }
    })
    .boxed()
}
