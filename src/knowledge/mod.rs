//! Knowledge 모듈 - 문서 청킹 및 벡터 저장소
//!
//! - Chunker: Markdown 인식 재귀 분할
//! - VectorStore: 백엔드 공통 트레이트
//! - LanceDB: 로컬 임베디드 벡터 검색
//! - Pinecone: 호스팅 서버리스 인덱스
//! - Ingest: 청킹 -> 임베딩 -> upsert

mod chunker;
mod ingest;
mod lance;
mod pinecone;
mod vector;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{get_pinecone_api_key, Settings, VectorBackend};

// Re-exports
pub use chunker::{default_chunker, markdown_chunker, ChunkConfig, Chunker, MarkdownChunker};
pub use ingest::{load_and_chunk, IngestReport, Ingestor, SourceChunk};
pub use lance::LanceVectorStore;
pub use pinecone::PineconeVectorStore;
pub use vector::{record_id, source_prefix, RetrievedChunk, VectorRecord, VectorStore};

/// 설정된 백엔드로 벡터 저장소 열기
pub async fn open_vector_store(settings: &Settings) -> Result<Arc<dyn VectorStore>> {
    match settings.vector_backend {
        VectorBackend::Lance => {
            let path = settings.lance_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create data directory")?;
            }

            let store =
                LanceVectorStore::open(&path, &settings.index_name, settings.embed_dimension).await?;
            Ok(Arc::new(store))
        }
        VectorBackend::Pinecone => {
            let api_key = get_pinecone_api_key()?;
            let store =
                PineconeVectorStore::new(api_key, &settings.index_name, &settings.pinecone_region)?;
            Ok(Arc::new(store))
        }
    }
}
