//! 임베딩 모듈 - OpenAI Embeddings API를 통한 텍스트 벡터화
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = create_embedder(&settings)?;
//! let embedding = embedder.embed("How do I define a kernel?").await?;
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{get_api_key, Settings};
use crate::openai::OpenAiClient;

/// 요청당 최대 입력 수
pub const MAX_BATCH_INPUTS: usize = 96;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 벡터로 변환하는 인터페이스입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// OpenAI Embedding
// ============================================================================

/// 요청 본문
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    dimensions: usize,
}

/// 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI 임베딩 구현체 (text-embedding-3 계열, 차원 축소 지원)
#[derive(Debug, Clone)]
pub struct OpenAiEmbedding {
    client: OpenAiClient,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedding {
    pub fn new(client: OpenAiClient, model: &str, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            anyhow::bail!("Invalid dimension: 0");
        }

        Ok(Self {
            client,
            model: model.to_string(),
            dimension,
        })
    }

    /// 비어있지 않은 입력만 한 번에 요청
    async fn request(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.model,
            input: inputs.to_vec(),
            dimensions: self.dimension,
        };
        let body = serde_json::to_value(&request).context("Failed to encode embedding request")?;

        let response: EmbedResponse = self
            .client
            .post_json("/embeddings", &body)
            .await?
            .json()
            .await
            .context("Failed to parse embedding response")?;

        order_by_index(response.data, inputs.len())
    }
}

/// 응답 벡터를 `index` 순으로 정렬
fn order_by_index(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if data.len() != expected {
        anyhow::bail!(
            "Embedding count mismatch: expected {}, got {}",
            expected,
            data.len()
        );
    }

    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // 빈 텍스트 처리
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        self.request(&[text])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = vec![vec![0.0; self.dimension]; texts.len()];

        // 빈 텍스트는 요청에서 제외하고 영벡터 유지
        let non_empty: Vec<(usize, &str)> = texts
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.trim().is_empty())
            .map(|(i, t)| (i, t.as_str()))
            .collect();

        for (batch_no, batch) in non_empty.chunks(MAX_BATCH_INPUTS).enumerate() {
            tracing::debug!("Embedding request {} ({} inputs)", batch_no + 1, batch.len());

            let inputs: Vec<&str> = batch.iter().map(|(_, t)| *t).collect();
            let vectors = self.request(&inputs).await?;

            for ((slot, _), vector) in batch.iter().zip(vectors) {
                results[*slot] = vector;
            }
        }

        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에서 임베딩 프로바이더 생성
pub fn create_embedder(settings: &Settings) -> Result<OpenAiEmbedding> {
    let client = OpenAiClient::new(&settings.openai_base_url, get_api_key()?)?;
    let embedder = OpenAiEmbedding::new(client, &settings.embed_model, settings.embed_dimension)?;

    tracing::info!(
        "Using {} embedding (dimension: {})",
        embedder.name(),
        embedder.dimension()
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================
