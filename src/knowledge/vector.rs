//! Vector Store - 벡터 저장소 트레이트 및 공통 타입
//!
//! 백엔드는 LanceDB(로컬)와 Pinecone(호스팅) 두 가지입니다.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Types
// ============================================================================

/// 벡터 레코드 (저장용)
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// 결정적 ID (`record_id`)
    pub id: String,
    /// 원본 파일 경로
    pub source: String,
    /// 청크 인덱스 (0-based)
    pub chunk_index: i32,
    /// 청크 텍스트
    pub text: String,
    /// 임베딩 벡터
    pub embedding: Vec<f32>,
}

/// 검색된 청크
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub source: Option<String>,
    pub chunk_index: i32,
    pub text: String,
    /// 유사도 스코어 (높을수록 유사)
    pub score: f32,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트 (async)
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 인덱스 준비 (없으면 생성)
    async fn ensure_index(&self, dimension: usize) -> Result<()>;

    /// 레코드 삽입/갱신 (같은 ID는 덮어씀)
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize>;

    /// 유사도 검색 (스코어 내림차순)
    async fn similarity_search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<RetrievedChunk>>;

    /// source 단위 삭제
    async fn delete_by_source(&self, source: &str) -> Result<usize>;

    /// 레코드 개수
    async fn count(&self) -> Result<usize>;

    /// 백엔드 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// source 해시 접두사 (16 hex)
pub fn source_prefix(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

/// 결정적 레코드 ID
///
/// 같은 파일을 다시 수집하면 같은 ID가 생성되어 덮어쓰게 됩니다.
pub fn record_id(source: &str, chunk_index: i32) -> String {
    format!("{}#{}", source_prefix(source), chunk_index)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_is_deterministic() {
        let a = record_id("data/clean/index.md", 0);
        let b = record_id("data/clean/index.md", 0);
        assert_eq!(a, b);
        assert!(a.ends_with("#0"));
        assert_eq!(a.len(), 16 + 2);
    }

    #[test]
    fn test_record_id_differs_by_source_and_index() {
        assert_ne!(record_id("a.md", 0), record_id("b.md", 0));
        assert_ne!(record_id("a.md", 0), record_id("a.md", 1));
        assert!(record_id("a.md", 3).starts_with(&source_prefix("a.md")));
    }
}
