//! OpenAI Chat Completions 구현체
//!
//! ref: https://platform.openai.com/docs/api-reference/chat

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{ChatMessage, ChatModel, Role, ToolCall, ToolSpec};
use crate::config::{get_api_key, Settings};
use crate::openai::OpenAiClient;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// 메시지 -> OpenAI 요청 형식
fn to_wire(message: &ChatMessage) -> Value {
    match message.role {
        Role::Assistant if !message.tool_calls.is_empty() => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect();

            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };

            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        Role::Tool => json!({
            "role": "tool",
            "content": message.content,
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
        }),
        role => json!({ "role": role.as_str(), "content": message.content }),
    }
}

/// 도구 정의 -> function 형식
fn tool_to_wire(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ============================================================================
// SSE Parsing
// ============================================================================

/// SSE 줄 버퍼
///
/// 네트워크 청크가 줄/UTF-8 경계와 무관하게 잘려 와도 완성된
/// `data:` 페이로드만 꺼냅니다.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 청크를 추가하고 완성된 data 페이로드 반환
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();

            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }

        payloads
    }
}

/// 스트림 델타에서 텍스트 추출
fn delta_content(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ============================================================================
// OpenAiChat
// ============================================================================

/// OpenAI 채팅 모델
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: OpenAiClient,
    model: String,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(client: OpenAiClient, model: &str, temperature: f32) -> Self {
        Self {
            client,
            model: model.to_string(),
            temperature,
        }
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &[ToolSpec], stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages.iter().map(to_wire).collect::<Vec<_>>(),
        });

        if let Some(obj) = body.as_object_mut() {
            if !tools.is_empty() {
                obj.insert(
                    "tools".to_string(),
                    Value::Array(tools.iter().map(tool_to_wire).collect()),
                );
            }
            if stream {
                obj.insert("stream".to_string(), json!(true));
            }
        }

        body
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatMessage> {
        let body = self.request_body(messages, tools, false);

        let response: CompletionResponse = self
            .client
            .post_json("/chat/completions", &body)
            .await?
            .json()
            .await
            .context("Failed to parse chat completion")?;

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow::anyhow!("Chat completion returned no choices"))?;

        let tool_calls: Vec<ToolCall> = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                name: c.function.name,
                arguments: c.function.arguments,
            })
            .collect();

        let content = message.content.unwrap_or_default();
        if tool_calls.is_empty() {
            Ok(ChatMessage::assistant(content))
        } else {
            Ok(ChatMessage::assistant_tool_calls(content, tool_calls))
        }
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<mpsc::Receiver<Result<String>>> {
        let body = self.request_body(messages, &[], true);
        let response = self.client.post_json("/chat/completions", &body).await?;

        let (tx, rx) = mpsc::channel(32);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = SseLineBuffer::new();

            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("Stream interrupted: {}", e))).await;
                        return;
                    }
                };

                for payload in buffer.push(&bytes) {
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Some(content) = delta_content(&payload) {
                        if tx.send(Ok(content)).await.is_err() {
                            return;
                        }
                    }
                }
            }

            // [DONE] 없이 끝나면 잘린 응답
            let _ = tx
                .send(Err(anyhow::anyhow!("Stream ended before [DONE]")))
                .await;
        });

        Ok(rx)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// 설정에서 채팅 모델 생성
pub fn create_chat_model(settings: &Settings) -> Result<OpenAiChat> {
    let client = OpenAiClient::new(&settings.openai_base_url, get_api_key()?)?;
    tracing::info!("Using chat model {}", settings.chat_model);
    Ok(OpenAiChat::new(client, &settings.chat_model, settings.temperature))
}

// ============================================================================
// Tests
// ============================================================================
