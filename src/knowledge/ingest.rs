//! Ingest - 정리된 Markdown 문서를 청킹/임베딩하여 벡터 저장소에 적재

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use super::chunker::Chunker;
use super::vector::{record_id, VectorRecord, VectorStore};
use crate::embedding::EmbeddingProvider;

/// 임베딩 요청 단위 (청크 수)
const EMBED_BATCH_SIZE: usize = 64;

// ============================================================================
// Types
// ============================================================================

/// 원본 파일 정보가 붙은 청크
#[derive(Debug, Clone, PartialEq)]
pub struct SourceChunk {
    pub source: String,
    pub chunk_index: i32,
    pub text: String,
}

/// 적재 결과
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub files: usize,
    pub chunks: usize,
    pub upserted: usize,
    /// 재적재 전에 제거된 기존 레코드 수
    pub replaced: usize,
}

// ============================================================================
// Loading
// ============================================================================

/// 폴더의 모든 `.md` 파일을 읽어 청크로 분할
///
/// 파일은 경로 순으로 정렬됩니다.
pub fn load_and_chunk(folder: &Path, chunker: &dyn Chunker) -> Result<Vec<SourceChunk>> {
    if !folder.is_dir() {
        anyhow::bail!("Folder not found: {}", folder.display());
    }

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(folder) {
        let entry = entry.context("Failed to walk folder")?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().and_then(|e| e.to_str()) == Some("md") {
            files.push(path.to_path_buf());
        }
    }
    files.sort();

    let mut chunks = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let source = path.to_string_lossy().to_string();

        for (i, chunk) in chunker.chunk(&text).into_iter().enumerate() {
            chunks.push(SourceChunk {
                source: source.clone(),
                chunk_index: i as i32,
                text: chunk,
            });
        }
    }

    Ok(chunks)
}

// ============================================================================
// Ingestor
// ============================================================================

/// 청킹 -> 임베딩 -> upsert 파이프라인
pub struct Ingestor {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    chunker: Box<dyn Chunker>,
}

impl Ingestor {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        chunker: Box<dyn Chunker>,
    ) -> Self {
        Self {
            embedder,
            store,
            chunker,
        }
    }

    /// 폴더 전체 적재
    pub async fn ingest_folder(&self, folder: &Path) -> Result<IngestReport> {
        self.store
            .ensure_index(self.embedder.dimension())
            .await
            .context("Failed to prepare vector index")?;

        let chunks = load_and_chunk(folder, self.chunker.as_ref())?;
        let mut report = IngestReport {
            chunks: chunks.len(),
            ..Default::default()
        };

        if chunks.is_empty() {
            tracing::warn!("No markdown chunks found in {}", folder.display());
            return Ok(report);
        }

        tracing::info!(
            "Embedding {} chunks with {} (batch {})",
            chunks.len(),
            self.embedder.name(),
            EMBED_BATCH_SIZE
        );

        // 전체 임베딩을 먼저 끝내야 중간 실패 시 기존 데이터가 남음
        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        for (batch_no, batch) in chunks.chunks(EMBED_BATCH_SIZE).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts)
                .await
                .with_context(|| format!("Failed to embed batch {}", batch_no + 1))?;

            if vectors.len() != texts.len() {
                anyhow::bail!(
                    "Embedding count mismatch: expected {}, got {}",
                    texts.len(),
                    vectors.len()
                );
            }
            embeddings.extend(vectors);
            tracing::debug!("Embedded {}/{}", embeddings.len(), chunks.len());
        }

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord {
                id: record_id(&chunk.source, chunk.chunk_index),
                source: chunk.source,
                chunk_index: chunk.chunk_index,
                text: chunk.text,
                embedding,
            })
            .collect();

        // source 단위로 기존 레코드 교체
        let mut start = 0;
        while start < records.len() {
            let source = records[start].source.clone();
            let end = records[start..]
                .iter()
                .position(|r| r.source != source)
                .map(|offset| start + offset)
                .unwrap_or(records.len());

            report.replaced += self.store.delete_by_source(&source).await?;
            report.upserted += self.store.upsert(&records[start..end]).await?;
            report.files += 1;

            tracing::info!("Ingested {} ({} chunks)", source, end - start);
            start = end;
        }

        Ok(report)
    }
}

// ============================================================================
// Tests
// ============================================================================
