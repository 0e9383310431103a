//! LanceDB Vector Store - 로컬 임베디드 벡터 인덱스
//!
//! 외부 서비스 없이 `~/.docqa/vectors.lance`에 청크 벡터를 저장합니다.
//! 검색은 코사인 거리 기반이며 스코어는 `1 - distance`입니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;

use super::vector::{RetrievedChunk, VectorRecord, VectorStore};

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소 구현
pub struct LanceVectorStore {
    db: Connection,
    table_name: String,
    dimension: usize,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    /// * `table_name` - 테이블 이름
    /// * `dimension` - 임베딩 차원
    pub async fn open(path: &Path, table_name: &str, dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self {
            db,
            table_name: table_name.to_string(),
            dimension,
        })
    }

    /// 벡터 테이블 스키마
    fn create_schema(dimension: usize) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("source", DataType::Utf8, false),
            Field::new("chunk_index", DataType::Int32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                false,
            ),
        ])
    }

    /// 레코드들을 Arrow RecordBatch로 변환
    fn records_to_batch(&self, records: &[VectorRecord]) -> Result<RecordBatch> {
        if records.is_empty() {
            anyhow::bail!("Cannot create batch from empty records");
        }

        if let Some(bad) = records.iter().find(|r| r.embedding.len() != self.dimension) {
            anyhow::bail!(
                "Embedding dimension mismatch for {}: expected {}, got {}",
                bad.id,
                self.dimension,
                bad.embedding.len()
            );
        }

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let sources: Vec<&str> = records.iter().map(|r| r.source.as_str()).collect();
        let chunk_indices: Vec<i32> = records.iter().map(|r| r.chunk_index).collect();
        let texts: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();

        let embeddings_flat: Vec<f32> = records
            .iter()
            .flat_map(|r| r.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        RecordBatch::try_new(
            Arc::new(Self::create_schema(self.dimension)),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(sources)),
                Arc::new(Int32Array::from(chunk_indices)),
                Arc::new(StringArray::from(texts)),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")
    }

    /// 테이블 존재 여부 확인
    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.contains(&self.table_name))
            .unwrap_or(false)
    }

    /// 테이블 열기
    async fn open_table(&self) -> Result<lancedb::table::Table> {
        self.db
            .open_table(&self.table_name)
            .execute()
            .await
            .with_context(|| format!("Failed to open table {}", self.table_name))
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn ensure_index(&self, dimension: usize) -> Result<()> {
        if dimension != self.dimension {
            anyhow::bail!(
                "Requested dimension {} does not match store dimension {}",
                dimension,
                self.dimension
            );
        }

        if self.table_exists().await {
            let table = self.open_table().await?;
            let schema = table.schema().await.context("Failed to read table schema")?;

            let existing = schema
                .field_with_name("embedding")
                .ok()
                .and_then(|f| match f.data_type() {
                    DataType::FixedSizeList(_, size) => Some(*size as usize),
                    _ => None,
                });

            if existing != Some(dimension) {
                anyhow::bail!(
                    "Table {} has embedding dimension {:?}, expected {}",
                    self.table_name,
                    existing,
                    dimension
                );
            }

            tracing::debug!("LanceDB table `{}` already exists", self.table_name);
            return Ok(());
        }

        self.db
            .create_empty_table(&self.table_name, Arc::new(Self::create_schema(dimension)))
            .execute()
            .await
            .context("Failed to create table")?;

        tracing::info!("Created LanceDB table: {} (dimension {})", self.table_name, dimension);
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        self.ensure_index(self.dimension).await?;
        let batch = self.records_to_batch(records)?;
        let schema = batch.schema();
        let table = self.open_table().await?;

        // 같은 ID 먼저 제거 후 추가
        let id_list = records
            .iter()
            .map(|r| format!("'{}'", escape_literal(&r.id)))
            .collect::<Vec<_>>()
            .join(", ");
        table
            .delete(&format!("id IN ({})", id_list))
            .await
            .context("Failed to delete existing vectors")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(batches)
            .execute()
            .await
            .context("Failed to add vectors to table")?;

        tracing::debug!("Upserted {} vectors into {}", records.len(), self.table_name);
        Ok(records.len())
    }

    async fn similarity_search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        if k == 0 || self.count().await? == 0 {
            return Ok(vec![]);
        }

        let table = self.open_table().await?;

        let stream = table
            .vector_search(query_embedding.to_vec())
            .context("Failed to create vector search")?
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await
            .context("Failed to execute vector search")?;

        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        let mut results = Vec::new();

        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let sources = string_column(&batch, "source")?;
            let texts = string_column(&batch, "text")?;

            let chunk_indices = batch
                .column_by_name("chunk_index")
                .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing chunk_index column"))?;

            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                let source = sources.value(i);
                results.push(RetrievedChunk {
                    id: ids.value(i).to_string(),
                    source: (!source.is_empty()).then(|| source.to_string()),
                    chunk_index: chunk_indices.value(i),
                    text: texts.value(i).to_string(),
                    score: 1.0 - distances.value(i),
                });
            }
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }

    async fn delete_by_source(&self, source: &str) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }

        let table = self.open_table().await?;
        let before = self.count().await?;

        table
            .delete(&format!("source = '{}'", escape_literal(source)))
            .await
            .context("Failed to delete vectors")?;

        let after = self.count().await?;
        Ok(before.saturating_sub(after))
    }

    async fn count(&self) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }

        let table = self.open_table().await?;
        table.count_rows(None).await.context("Failed to count rows")
    }

    fn name(&self) -> &str {
        "lancedb"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// SQL 문자열 리터럴 이스케이프
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// 문자열 컬럼 추출
fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

// ============================================================================
// Tests
// ============================================================================
