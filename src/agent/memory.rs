//! Checkpointer - 스레드별 대화 상태 저장
//!
//! - MemoryCheckpointer: 프로세스 메모리 (재시작 시 소멸)
//! - SqliteCheckpointer: rusqlite 파일 DB

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;

use crate::llm::{ChatMessage, Role, ToolCall};

/// 스레드 제목 최대 길이 (문자)
const TITLE_MAX_CHARS: usize = 60;

// ============================================================================
// Types
// ============================================================================

/// 스레드 요약
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub id: String,
    /// 첫 사용자 메시지 앞부분
    pub title: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Checkpointer Trait
// ============================================================================

/// 스레드 단위 대화 저장소
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// 스레드 메시지 전체 (없으면 빈 목록)
    async fn load(&self, thread_id: &str) -> Result<Vec<ChatMessage>>;

    /// 메시지 추가 (순서 유지)
    async fn append(&self, thread_id: &str, messages: &[ChatMessage]) -> Result<()>;

    /// 최근 갱신 순 스레드 목록
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>>;

    /// 스레드 삭제 (존재했으면 true)
    async fn delete_thread(&self, thread_id: &str) -> Result<bool>;
}

/// 첫 사용자 메시지로 제목 생성
fn thread_title(messages: &[ChatMessage]) -> String {
    let first = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.trim())
        .unwrap_or_default();

    let mut title: String = first.chars().take(TITLE_MAX_CHARS).collect();
    if first.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

// ============================================================================
// MemoryCheckpointer
// ============================================================================

#[derive(Debug, Clone)]
struct ThreadState {
    messages: Vec<ChatMessage>,
    updated_at: DateTime<Utc>,
}

/// 인메모리 체크포인터
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    threads: tokio::sync::Mutex<HashMap<String, ThreadState>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn load(&self, thread_id: &str) -> Result<Vec<ChatMessage>> {
        let threads = self.threads.lock().await;
        Ok(threads
            .get(thread_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default())
    }

    async fn append(&self, thread_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let mut threads = self.threads.lock().await;
        let state = threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadState {
                messages: Vec::new(),
                updated_at: Utc::now(),
            });

        state.messages.extend_from_slice(messages);
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let threads = self.threads.lock().await;
        let mut summaries: Vec<ThreadSummary> = threads
            .iter()
            .map(|(id, state)| ThreadSummary {
                id: id.clone(),
                title: thread_title(&state.messages),
                message_count: state.messages.len(),
                updated_at: state.updated_at,
            })
            .collect();

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        Ok(self.threads.lock().await.remove(thread_id).is_some())
    }
}

// ============================================================================
// SqliteCheckpointer
// ============================================================================

/// SQLite 체크포인터
///
/// 저장 위치: `{data_dir}/threads.db`
pub struct SqliteCheckpointer {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointer {
    /// DB 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.initialize()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                thread_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT,
                tool_call_id TEXT,
                PRIMARY KEY (thread_id, seq)
            );",
        )
        .context("Failed to create checkpoint tables")?;

        Ok(())
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn load(&self, thread_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT role, content, tool_calls, tool_call_id
             FROM messages WHERE thread_id = ?1 ORDER BY seq",
        )?;

        let rows = stmt.query_map(params![thread_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content, tool_calls, tool_call_id) = row?;
            let tool_calls: Vec<ToolCall> = match tool_calls {
                Some(json) => serde_json::from_str(&json).context("Corrupt tool_calls column")?,
                None => Vec::new(),
            };

            messages.push(ChatMessage {
                role: role.parse()?,
                content,
                tool_calls,
                tool_call_id,
            });
        }

        Ok(messages)
    }

    async fn append(&self, thread_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let exists = tx
            .query_row(
                "SELECT 1 FROM threads WHERE id = ?1",
                params![thread_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if exists {
            tx.execute(
                "UPDATE threads SET updated_at = ?2 WHERE id = ?1",
                params![thread_id, now],
            )?;
        } else {
            tx.execute(
                "INSERT INTO threads (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![thread_id, thread_title(messages), now],
            )?;
        }

        let mut seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM messages WHERE thread_id = ?1",
            params![thread_id],
            |row| row.get(0),
        )?;

        for message in messages {
            let tool_calls = if message.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&message.tool_calls)?)
            };

            tx.execute(
                "INSERT INTO messages (thread_id, seq, role, content, tool_calls, tool_call_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    thread_id,
                    seq,
                    message.role.as_str(),
                    message.content,
                    tool_calls,
                    message.tool_call_id
                ],
            )?;
            seq += 1;
        }

        tx.commit().context("Failed to commit messages")?;
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT t.id, t.title, t.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.thread_id = t.id)
             FROM threads t
             ORDER BY t.updated_at DESC, t.id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(ThreadSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                updated_at: parse_datetime(row.get(2)?),
                message_count: row.get::<_, i64>(3)? as usize,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list threads")
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM messages WHERE thread_id = ?1", params![thread_id])?;
        let removed = tx.execute("DELETE FROM threads WHERE id = ?1", params![thread_id])?;

        tx.commit()?;
        Ok(removed > 0)
    }
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================
