//! # 通用的 LLM API 消息结构体
//!
//! OpenAI 兼容格式的对话消息与工具调用描述

use serde::{Deserialize, Serialize};

/// 工具调用结构体（模型返回的 function call）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCallMessage {
    /// 工具调用 ID，回传工具结果时需要对应
    pub id: String,
    /// 工具类型，通常为 "function"
    #[serde(rename = "type")]
    pub tool_type: String,
    /// 要调用的函数信息
    pub function: FunctionCall,
}

/// 函数调用信息
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// 函数名称
    pub name: String,
    /// 函数参数（JSON 编码后的字符串）
    pub arguments: String,
}

/// 通用聊天消息结构体
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    /// 消息角色：system、user、assistant、tool
    pub role: String,
    /// 消息内容文本
    pub content: String,
    /// 助手消息中的工具调用列表
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallMessage>>,
    /// 工具消息对应的调用 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// 工具名称（当角色为 tool 时使用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn with_role(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// 创建系统消息
    pub fn system(content: String) -> Self {
        Self::with_role("system", content)
    }

    /// 创建用户消息
    pub fn user(content: String) -> Self {
        Self::with_role("user", content)
    }

    /// 创建助手消息
    pub fn assistant(content: String) -> Self {
        Self::with_role("assistant", content)
    }

    /// 创建工具结果消息
    pub fn tool(content: String, tool_name: String, tool_call_id: String) -> Self {
        Self {
            role: "tool".to_string(),
            content,
            tool_calls: None,
            tool_call_id: Some(tool_call_id),
            name: Some(tool_name),
        }
    }

    /// 为助手消息添加工具调用
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallMessage>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }
}
