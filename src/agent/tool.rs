//! Retrieve Tool - 질의를 임베딩하여 문서 청크 검색

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::embedding::EmbeddingProvider;
use crate::knowledge::{RetrievedChunk, VectorStore};
use crate::llm::ToolSpec;

/// 도구 이름
pub const RETRIEVE_TOOL_NAME: &str = "retrieve";

/// 도구 실행 결과 (모델에 보낼 텍스트 + 원본 청크)
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub artifact: Vec<RetrievedChunk>,
}

/// retrieve 도구 인자
#[derive(Debug, Deserialize)]
pub struct RetrieveArgs {
    pub query: String,
}

impl RetrieveArgs {
    /// JSON 인자 파싱
    pub fn parse(arguments: &str) -> Result<Self> {
        serde_json::from_str(arguments).context("Invalid retrieve arguments, expected {\"query\": string}")
    }
}

/// 문서 검색 도구
#[derive(Clone)]
pub struct RetrieveTool {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    k: usize,
    site_name: String,
}

impl RetrieveTool {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        k: usize,
        site_name: &str,
    ) -> Self {
        Self {
            embedder,
            store,
            k,
            site_name: site_name.to_string(),
        }
    }

    /// 모델에 바인딩할 도구 정의
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: RETRIEVE_TOOL_NAME.to_string(),
            description: format!("Retrieve {} documentation related to a query", self.site_name),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"],
            }),
        }
    }

    /// 검색 실행
    pub async fn run(&self, query: &str) -> Result<ToolOutput> {
        let embedding = self
            .embedder
            .embed(query)
            .await
            .context("Failed to embed query")?;

        let hits = self
            .store
            .similarity_search(&embedding, self.k)
            .await
            .context("Vector search failed")?;

        tracing::debug!("retrieve({:?}) -> {} hits", query, hits.len());

        Ok(ToolOutput {
            content: format_summary(&hits),
            artifact: hits,
        })
    }
}

/// 검색 결과 요약 (`Source: ..` + 본문, 빈 줄로 구분)
pub fn format_summary(hits: &[RetrievedChunk]) -> String {
    hits.iter()
        .map(|hit| {
            format!(
                "Source: {}\n{}",
                hit.source.as_deref().unwrap_or("unknown"),
                hit.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
