//! Agent 모듈 - 검색 도구 기반 질의응답 턴 처리
//!
//! 한 턴의 흐름:
//!
//! 1. `query_or_respond`: retrieve 도구를 바인딩한 모델 호출.
//!    도구 호출이 없으면 그 응답이 최종 답변입니다.
//! 2. `tools`: 모든 도구 호출을 순서대로 실행하고, 호출마다 같은 ID의
//!    tool 메시지를 정확히 하나씩 남깁니다.
//! 3. `generate`: 마지막 tool 메시지들을 근거로 시스템 프롬프트를
//!    구성하고 답변을 스트리밍합니다.
//!
//! 턴이 성공해야만 체크포인터에 저장합니다.

mod memory;
mod tool;

#[cfg(test)]
pub(crate) mod fakes;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::knowledge::RetrievedChunk;
use crate::llm::{ChatMessage, ChatModel, Role, ToolCall};

pub use memory::{Checkpointer, MemoryCheckpointer, SqliteCheckpointer, ThreadSummary};
pub use tool::{format_summary, RetrieveArgs, RetrieveTool, ToolOutput, RETRIEVE_TOOL_NAME};

// ============================================================================
// Events & Options
// ============================================================================

/// 턴 진행 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// 답변 텍스트 조각
    Token(String),
    /// 도구 호출 시작
    ToolCall { name: String, query: String },
    /// 검색된 근거 청크
    Sources(Vec<RetrievedChunk>),
    /// 턴 완료
    Done { answer: String },
    /// 턴 실패 (저장되지 않음)
    Error(String),
}

/// 에이전트 설정
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// 시스템 프롬프트에 들어가는 문서 이름
    pub site_name: String,
    /// generate 단계 근거 최대 길이 (문자)
    pub max_context_chars: usize,
    /// 프롬프트에 포함할 최대 대화 메시지 수
    pub max_history_messages: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            site_name: "RACCOON".to_string(),
            max_context_chars: 12_000,
            max_history_messages: 20,
        }
    }
}

// ============================================================================
// Prompt Helpers
// ============================================================================

/// 시스템 프롬프트 (근거 제외)
pub fn system_prompt(site_name: &str) -> String {
    format!(
        "You are an expert assistant answering questions strictly based on the {site} documentation. \
         Use only the retrieved context below to answer the user's question. \
         Do not provide general knowledge or external explanations, answer only if the information \
         is directly supported by the documentation. \
         If the answer is not in the context, say you don't know. \
         Be concise and use no more than three sentences.",
        site = site_name
    )
}

/// 상태 끝에 연속된 tool 메시지 (원래 순서)
fn trailing_tool_messages(state: &[ChatMessage]) -> &[ChatMessage] {
    let start = state
        .iter()
        .rposition(|m| m.role != Role::Tool)
        .map(|i| i + 1)
        .unwrap_or(0);
    &state[start..]
}

/// 문자 경계에서 자르기
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// 근거 텍스트 (tool 메시지 내용을 빈 줄로 연결, 길이 제한)
fn build_evidence(state: &[ChatMessage], max_chars: usize) -> String {
    let joined = trailing_tool_messages(state)
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let truncated = truncate_chars(&joined, max_chars);
    if truncated.len() < joined.len() {
        tracing::debug!(
            "Evidence truncated to {} chars (from {})",
            max_chars,
            joined.chars().count()
        );
    }
    truncated.to_string()
}

/// 답변 생성용 대화 (user/system/도구 호출 없는 assistant만)
fn conversation_messages(state: &[ChatMessage], max_messages: usize) -> Vec<ChatMessage> {
    let filtered: Vec<&ChatMessage> = state
        .iter()
        .filter(|m| match m.role {
            Role::User | Role::System => true,
            Role::Assistant => m.tool_calls.is_empty(),
            Role::Tool => false,
        })
        .collect();

    let skip = filtered.len().saturating_sub(max_messages.max(1));
    filtered.into_iter().skip(skip).cloned().collect()
}

/// 도구 선택용 대화 창
///
/// 최근 메시지만 남기되, 도구 호출/결과 쌍이 잘리지 않도록
/// 첫 메시지가 user가 될 때까지 앞을 버립니다.
fn history_window(state: &[ChatMessage], max_messages: usize) -> &[ChatMessage] {
    let mut start = state.len().saturating_sub(max_messages.max(1));
    while start < state.len() && state[start].role != Role::User {
        start += 1;
    }

    // user 메시지가 창 밖에만 있으면 마지막 user부터
    if start == state.len() {
        start = state.iter().rposition(|m| m.role == Role::User).unwrap_or(0);
    }
    &state[start..]
}

/// Mermaid 흐름도
pub fn flow_diagram() -> String {
    [
        "graph TD",
        "    __start__([START]) --> query_or_respond",
        "    query_or_respond -->|tool call| tools",
        "    query_or_respond -->|no tool call| __end__([END])",
        "    tools --> generate",
        "    generate --> __end__",
    ]
    .join("\n")
}

// ============================================================================
// DocsAgent
// ============================================================================

/// 문서 질의응답 에이전트
#[derive(Clone)]
pub struct DocsAgent {
    model: Arc<dyn ChatModel>,
    tool: RetrieveTool,
    checkpointer: Arc<dyn Checkpointer>,
    options: AgentOptions,
}

impl DocsAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tool: RetrieveTool,
        checkpointer: Arc<dyn Checkpointer>,
        options: AgentOptions,
    ) -> Self {
        Self {
            model,
            tool,
            checkpointer,
            options,
        }
    }

    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    /// 한 턴 실행 (이벤트 스트림 반환)
    ///
    /// 마지막 이벤트는 항상 `Done` 또는 `Error`입니다.
    pub fn run_turn(&self, thread_id: &str, user_input: &str) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(64);
        let agent = self.clone();
        let thread_id = thread_id.to_string();
        let user_input = user_input.to_string();

        tokio::spawn(async move {
            match agent.execute_turn(&thread_id, &user_input, &tx).await {
                Ok(answer) => {
                    let _ = tx.send(AgentEvent::Done { answer }).await;
                }
                Err(e) => {
                    tracing::error!("Turn failed on thread {}: {:#}", thread_id, e);
                    let _ = tx.send(AgentEvent::Error(format!("{:#}", e))).await;
                }
            }
        });

        rx
    }

    /// 한 턴 실행 후 최종 답변만 반환
    pub async fn ask(&self, thread_id: &str, user_input: &str) -> Result<String> {
        let mut rx = self.run_turn(thread_id, user_input);
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Done { answer } => return Ok(answer),
                AgentEvent::Error(message) => anyhow::bail!(message),
                _ => {}
            }
        }
        anyhow::bail!("Turn ended without a result")
    }

    async fn execute_turn(
        &self,
        thread_id: &str,
        user_input: &str,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<String> {
        // load
        let mut state = self.checkpointer.load(thread_id).await?;
        let turn_start = state.len();
        state.push(ChatMessage::user(user_input));

        // query_or_respond
        let window = history_window(&state, self.options.max_history_messages);
        let reply = self.model.complete(window, &[self.tool.spec()]).await?;

        if !reply.is_tool_request() {
            let answer = reply.content.clone();
            let _ = tx.send(AgentEvent::Token(answer.clone())).await;

            state.push(reply);
            self.checkpointer.append(thread_id, &state[turn_start..]).await?;
            return Ok(answer);
        }

        // tools
        let calls = reply.tool_calls.clone();
        state.push(reply);
        for call in &calls {
            let message = self.run_tool_call(call, tx).await;
            state.push(message);
        }

        // generate
        let evidence = build_evidence(&state, self.options.max_context_chars);
        let mut prompt = vec![ChatMessage::system(format!(
            "{}\n\n{}",
            system_prompt(&self.options.site_name),
            evidence
        ))];
        prompt.extend(conversation_messages(&state, self.options.max_history_messages));

        let mut stream = self.model.stream(&prompt).await?;
        let mut answer = String::new();
        while let Some(delta) = stream.recv().await {
            let delta = delta?;
            answer.push_str(&delta);
            let _ = tx.send(AgentEvent::Token(delta)).await;
        }

        state.push(ChatMessage::assistant(answer.clone()));
        self.checkpointer.append(thread_id, &state[turn_start..]).await?;

        tracing::info!(
            "Thread {}: answered with {} tool call(s)",
            thread_id,
            calls.len()
        );
        Ok(answer)
    }

    /// 도구 호출 하나 실행 -> 같은 ID의 tool 메시지
    async fn run_tool_call(&self, call: &ToolCall, tx: &mpsc::Sender<AgentEvent>) -> ChatMessage {
        if call.name != RETRIEVE_TOOL_NAME {
            tracing::warn!("Model requested unknown tool: {}", call.name);
            return ChatMessage::tool(&call.id, format!("Error: unknown tool `{}`", call.name));
        }

        let args = match RetrieveArgs::parse(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                let _ = tx
                    .send(AgentEvent::ToolCall {
                        name: call.name.clone(),
                        query: call.arguments.clone(),
                    })
                    .await;
                return ChatMessage::tool(&call.id, format!("Error: {:#}", e));
            }
        };

        let _ = tx
            .send(AgentEvent::ToolCall {
                name: call.name.clone(),
                query: args.query.clone(),
            })
            .await;

        match self.tool.run(&args.query).await {
            Ok(output) => {
                let _ = tx.send(AgentEvent::Sources(output.artifact)).await;
                ChatMessage::tool(&call.id, output.content)
            }
            Err(e) => {
                tracing::warn!("retrieve failed: {:#}", e);
                ChatMessage::tool(&call.id, format!("Error: {:#}", e))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
