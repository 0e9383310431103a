//! 테스트용 가짜 모델/임베더/저장소

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{
    AgentEvent, AgentOptions, Checkpointer, DocsAgent, MemoryCheckpointer, RetrieveTool, ThreadSummary,
};
use crate::embedding::EmbeddingProvider;
use crate::knowledge::{RetrievedChunk, VectorRecord, VectorStore};
use crate::llm::{ChatMessage, ChatModel, ToolCall, ToolSpec};

/// 미리 정한 응답을 순서대로 돌려주는 모델
#[derive(Default)]
pub(crate) struct ScriptedModel {
    pub(crate) completions: Mutex<VecDeque<Result<ChatMessage>>>,
    pub(crate) streams: Mutex<VecDeque<Vec<Result<String>>>>,
    pub(crate) seen_complete: Mutex<Vec<Vec<ChatMessage>>>,
    pub(crate) seen_stream: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub(crate) fn new(completions: Vec<Result<ChatMessage>>, streams: Vec<Vec<&str>>) -> Arc<Self> {
        Arc::new(Self {
            completions: Mutex::new(completions.into_iter().collect()),
            streams: Mutex::new(
                streams
                    .into_iter()
                    .map(|s| s.into_iter().map(|d| Ok(d.to_string())).collect())
                    .collect(),
            ),
            ..Default::default()
        })
    }

    /// 델타 몇 개를 보낸 뒤 에러로 끊기는 스트림
    pub(crate) fn with_broken_stream(
        completions: Vec<Result<ChatMessage>>,
        deltas: Vec<&str>,
        error: &str,
    ) -> Arc<Self> {
        let mut stream: Vec<Result<String>> = deltas.into_iter().map(|d| Ok(d.to_string())).collect();
        stream.push(Err(anyhow::anyhow!(error.to_string())));
        Arc::new(Self {
            completions: Mutex::new(completions.into_iter().collect()),
            streams: Mutex::new(VecDeque::from(vec![stream])),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatMessage> {
        assert_eq!(tools.len(), 1);
        self.seen_complete.lock().await.push(messages.to_vec());
        self.completions
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted completion")))
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<mpsc::Receiver<Result<String>>> {
        self.seen_stream.lock().await.push(messages.to_vec());
        let deltas = self.streams.lock().await.pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(16);
        for delta in deltas {
            tx.send(delta).await.unwrap();
        }
        Ok(rx)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// 읽기는 되지만 쓰기는 항상 실패하는 저장소
pub(crate) struct ReadOnlyCheckpointer {
    pub(crate) inner: Arc<MemoryCheckpointer>,
}

#[async_trait]
impl Checkpointer for ReadOnlyCheckpointer {
    async fn load(&self, thread_id: &str) -> Result<Vec<ChatMessage>> {
        self.inner.load(thread_id).await
    }

    async fn append(&self, _thread_id: &str, _messages: &[ChatMessage]) -> Result<()> {
        anyhow::bail!("disk full")
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        self.inner.list_threads().await
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        self.inner.delete_thread(thread_id).await
    }
}

pub(crate) struct FakeEmbedder;

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }

    fn dimension(&self) -> usize {
        2
    }

    fn name(&self) -> &str {
        "fake"
    }
}

pub(crate) struct FixedStore {
    pub(crate) hits: Vec<RetrievedChunk>,
    pub(crate) fail: bool,
}

#[async_trait]
impl VectorStore for FixedStore {
    async fn ensure_index(&self, _dimension: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        Ok(records.len())
    }

    async fn similarity_search(&self, _q: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        if self.fail {
            anyhow::bail!("index unavailable");
        }
        Ok(self.hits.iter().take(k).cloned().collect())
    }

    async fn delete_by_source(&self, _source: &str) -> Result<usize> {
        Ok(0)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.hits.len())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

pub(crate) fn hit(source: &str, text: &str) -> RetrievedChunk {
    RetrievedChunk {
        id: format!("{}#0", source),
        source: Some(source.to_string()),
        chunk_index: 0,
        text: text.to_string(),
        score: 0.8,
    }
}

pub(crate) fn tool_request(calls: &[(&str, &str, &str)]) -> ChatMessage {
    ChatMessage::assistant_tool_calls(
        "",
        calls
            .iter()
            .map(|(id, name, args)| ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect(),
    )
}

pub(crate) fn agent_with(
    model: Arc<ScriptedModel>,
    store: FixedStore,
    checkpointer: Arc<dyn Checkpointer>,
    options: AgentOptions,
) -> DocsAgent {
    let tool = RetrieveTool::new(Arc::new(FakeEmbedder), Arc::new(store), 4, &options.site_name);
    DocsAgent::new(model, tool, checkpointer, options)
}

pub(crate) fn default_store() -> FixedStore {
    FixedStore {
        hits: vec![hit("kernels.md", "Kernels add residual terms.")],
        fail: false,
    }
}

pub(crate) async fn collect(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
