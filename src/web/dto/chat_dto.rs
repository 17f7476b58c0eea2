use serde::{Deserialize, Serialize};

use crate::engine::{ExchangeError, ExchangeRequest};

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatQueryRequest {
    /// 不传时生成新会话
    pub session_id: Option<String>,
    pub query: String,
    /// 文档文本，作为 [CONTEXT] 块附在提问前
    pub document_context: Option<String>,
}

impl ChatQueryRequest {
    pub fn into_exchange(self) -> ExchangeRequest {
        let session_id = self
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        ExchangeRequest {
            session_id,
            query: self.query,
            document_context: self.document_context,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatQueryResponse {
    pub session_id: String,
    pub answer: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearChatQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearChatResponse {
    pub status: String,
    pub session_id: String,
    pub had_history: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ExchangeError,
}
