//! LLM 모듈 - 채팅 메시지 타입과 ChatModel 트레이트
//!
//! 메시지는 체크포인터에 그대로 저장되므로 serde로 직렬화됩니다.

mod openai;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use openai::{create_chat_model, OpenAiChat, SseLineBuffer};

// ============================================================================
// Message Types
// ============================================================================

/// 메시지 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => anyhow::bail!("Unknown role: {}", other),
        }
    }
}

/// 모델이 요청한 도구 호출
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON 텍스트 그대로
    pub arguments: String,
}

/// 모델에 바인딩할 도구 정의
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema
    pub parameters: serde_json::Value,
}

/// 채팅 메시지
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// 도구 호출만 담은 assistant 메시지
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// 도구 실행 결과 메시지
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// 도구 호출을 요청하는 assistant 메시지인지
    pub fn is_tool_request(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

// ============================================================================
// ChatModel Trait
// ============================================================================

/// 채팅 모델 트레이트
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// 단일 응답 (도구 호출 가능)
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatMessage>;

    /// 스트리밍 응답 (텍스트 델타)
    async fn stream(&self, messages: &[ChatMessage]) -> Result<mpsc::Receiver<Result<String>>>;

    /// 모델 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let call = ToolCall {
            id: "call_1".to_string(),
            name: "retrieve".to_string(),
            arguments: r#"{"query":"kernels"}"#.to_string(),
        };

        let request = ChatMessage::assistant_tool_calls("", vec![call]);
        assert!(request.is_tool_request());
        assert!(!ChatMessage::assistant("hi").is_tool_request());
        assert!(!ChatMessage::user("hi").is_tool_request());

        let tool = ChatMessage::tool("call_1", "result");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_message_serde_skips_empty_fields() {
        let json = serde_json::to_value(ChatMessage::user("hello")).unwrap();
        assert_eq!(json, serde_json::json!({ "role": "user", "content": "hello" }));

        let parsed: ChatMessage =
            serde_json::from_str(r#"{"role":"tool","content":"x","tool_call_id":"c"}"#).unwrap();
        assert_eq!(parsed, ChatMessage::tool("c", "x"));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!(Role::Tool.as_str(), "tool");
        assert!("bot".parse::<Role>().is_err());
    }
}
