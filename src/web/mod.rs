//! Web 모듈 - 채팅 UI 및 SSE 스트리밍 API
//!
//! | 경로 | 설명 |
//! |---|---|
//! | `GET /` | 채팅 페이지 |
//! | `GET /health` | 상태 확인 |
//! | `POST /api/chat` | 한 턴 실행 (SSE) |
//! | `GET /api/threads` | 스레드 목록 |
//! | `GET /api/threads/:id/messages` | 스레드 대화 (user + 최종 답변) |
//! | `DELETE /api/threads/:id` | 스레드 삭제 |

mod errors;

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        Html, IntoResponse, Sse,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::{AgentEvent, DocsAgent, ThreadSummary};
use crate::llm::Role;

pub use errors::{ApiError, ApiResult};

const INDEX_HTML: &str = include_str!("index.html");

// ============================================================================
// State & Router
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub agent: DocsAgent,
}

/// 라우터 구성
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/threads", get(list_threads))
        .route("/api/threads/:id", delete(delete_thread))
        .route("/api/threads/:id/messages", get(thread_messages))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 서버 실행
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .await
        .context("Server error")
}

// ============================================================================
// Handlers
// ============================================================================

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    thread_id: Option<String>,
    message: String,
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }

    let thread_id = req
        .thread_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::info!("Chat turn on thread {}", thread_id);

    let rx = state.agent.run_turn(&thread_id, message);
    let head = tokio_stream::once(Ok::<_, Infallible>(
        Event::default()
            .event("thread")
            .data(json!({ "thread_id": thread_id }).to_string()),
    ));
    let events = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(to_sse(event)));

    Ok(Sse::new(head.chain(events)).keep_alive(KeepAlive::default()))
}

/// 에이전트 이벤트 -> SSE 이벤트 (data는 항상 JSON)
fn to_sse(event: AgentEvent) -> Event {
    let (name, data) = match event {
        AgentEvent::Token(text) => ("token", json!({ "text": text })),
        AgentEvent::ToolCall { name, query } => ("tool", json!({ "name": name, "query": query })),
        AgentEvent::Sources(hits) => ("sources", json!(hits)),
        AgentEvent::Done { answer } => ("done", json!({ "answer": answer })),
        AgentEvent::Error(message) => ("error", json!({ "error": message })),
    };

    Event::default().event(name).data(data.to_string())
}

async fn list_threads(State(state): State<AppState>) -> ApiResult<Json<Vec<ThreadSummary>>> {
    let threads = state.agent.checkpointer().list_threads().await?;
    Ok(Json(threads))
}

#[derive(Debug, Serialize)]
struct DisplayMessage {
    role: &'static str,
    content: String,
}

async fn thread_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<DisplayMessage>>> {
    let messages = state.agent.checkpointer().load(&id).await?;
    if messages.is_empty() {
        return Err(ApiError::NotFound(format!("thread {}", id)));
    }

    let visible = messages
        .into_iter()
        .filter(|m| m.role == Role::User || (m.role == Role::Assistant && m.tool_calls.is_empty()))
        .map(|m| DisplayMessage {
            role: m.role.as_str(),
            content: m.content,
        })
        .collect();

    Ok(Json(visible))
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.agent.checkpointer().delete_thread(&id).await? {
        tracing::info!("Deleted thread {}", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("thread {}", id)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fakes::{agent_with, default_store, tool_request, ScriptedModel};
    use crate::agent::{AgentOptions, Checkpointer, MemoryCheckpointer};
    use crate::llm::ChatMessage;
    use std::sync::Arc;

    async fn spawn_app(model: Arc<ScriptedModel>) -> (String, Arc<MemoryCheckpointer>) {
        let memory = Arc::new(MemoryCheckpointer::new());
        let agent = agent_with(model, default_store(), memory.clone(), AgentOptions::default());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(AppState { agent })).await;
        });
        (base, memory)
    }

    /// SSE 본문 -> (이벤트 이름, data JSON)
    fn parse_sse(body: &str) -> Vec<(String, serde_json::Value)> {
        let mut events = Vec::new();
        let mut name = String::new();
        for line in body.lines() {
            if let Some(n) = line.strip_prefix("event:") {
                name = n.trim().to_string();
            } else if let Some(d) = line.strip_prefix("data:") {
                events.push((name.clone(), serde_json::from_str(d.trim()).unwrap()));
            }
        }
        events
    }

    #[tokio::test]
    async fn test_index_and_health() {
        let (base, _) = spawn_app(ScriptedModel::new(vec![], vec![])).await;

        let page = reqwest::get(format!("{}/", base)).await.unwrap().text().await.unwrap();
        assert!(page.contains("<html"));

        let health: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
    }

    #[tokio::test]
    async fn test_chat_streams_events() {
        let model = ScriptedModel::new(
            vec![Ok(tool_request(&[("c1", "retrieve", r#"{"query":"kernel"}"#)]))],
            vec![vec!["Kernels ", "add residuals."]],
        );
        let (base, memory) = spawn_app(model).await;

        let body = reqwest::Client::new()
            .post(format!("{}/api/chat", base))
            .json(&json!({ "thread_id": "web-1", "message": "What is a kernel?" }))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let events = parse_sse(&body);
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["thread", "tool", "sources", "token", "token", "done"]);
        assert_eq!(events[0].1["thread_id"], "web-1");
        assert_eq!(events[1].1["query"], "kernel");
        assert_eq!(events[2].1[0]["source"], "kernels.md");
        assert_eq!(events[5].1["answer"], "Kernels add residuals.");

        assert_eq!(memory.load("web-1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_message() {
        let (base, _) = spawn_app(ScriptedModel::new(vec![], vec![])).await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/chat", base))
            .json(&json!({ "message": "   " }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn test_thread_endpoints() {
        let (base, memory) = spawn_app(ScriptedModel::new(vec![], vec![])).await;
        memory
            .append(
                "t1",
                &[
                    ChatMessage::user("q"),
                    tool_request(&[("c", "retrieve", "{}")]),
                    ChatMessage::tool("c", "docs"),
                    ChatMessage::assistant("answer"),
                ],
            )
            .await
            .unwrap();
        let client = reqwest::Client::new();

        let threads: serde_json::Value = client
            .get(format!("{}/api/threads", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(threads[0]["id"], "t1");
        assert_eq!(threads[0]["message_count"], 4);

        let messages: serde_json::Value = client
            .get(format!("{}/api/threads/t1/messages", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            messages,
            json!([
                { "role": "user", "content": "q" },
                { "role": "assistant", "content": "answer" }
            ])
        );

        let deleted = client.delete(format!("{}/api/threads/t1", base)).send().await.unwrap();
        assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);

        let again = client.delete(format!("{}/api/threads/t1", base)).send().await.unwrap();
        assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);

        let missing = client
            .get(format!("{}/api/threads/t1/messages", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
