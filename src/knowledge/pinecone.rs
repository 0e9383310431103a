//! Pinecone Vector Store - 호스팅 서버리스 벡터 인덱스 (REST)
//!
//! 컨트롤 플레인(api.pinecone.io)에서 인덱스를 생성/조회하고,
//! 인덱스별 데이터 플레인 호스트로 upsert/query를 보냅니다.
//! ref: https://docs.pinecone.io/reference/api/introduction

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;

use super::vector::{source_prefix, RetrievedChunk, VectorRecord, VectorStore};

/// 컨트롤 플레인 주소
const CONTROL_URL: &str = "https://api.pinecone.io";
/// API 버전 헤더 값
const API_VERSION: &str = "2024-07";
/// upsert 배치 크기
const UPSERT_BATCH: usize = 100;
/// 새 인덱스 준비 대기 (최대 횟수 x 간격)
const READY_POLL_ATTEMPTS: u32 = 60;
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct IndexDescription {
    host: String,
    dimension: Option<usize>,
    #[serde(default)]
    status: IndexStatus,
}

#[derive(Debug, Default, Deserialize)]
struct IndexStatus {
    #[serde(default)]
    ready: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct VectorMetadata {
    source: String,
    text: String,
    chunk_index: i32,
}

#[derive(Debug, Serialize)]
struct UpsertVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: VectorMetadata,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    score: f32,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IndexStats {
    #[serde(rename = "totalVectorCount", default)]
    total_vector_count: usize,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    vectors: Vec<ListedVector>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct ListedVector {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next: Option<String>,
}

// ============================================================================
// PineconeVectorStore
// ============================================================================

/// Pinecone 벡터 저장소
pub struct PineconeVectorStore {
    client: reqwest::Client,
    api_key: String,
    index_name: String,
    region: String,
    control_url: String,
    host: OnceCell<String>,
    ready_attempts: u32,
    ready_interval: Duration,
}

impl PineconeVectorStore {
    /// 새 저장소 핸들 생성 (네트워크 호출 없음)
    pub fn new(api_key: String, index_name: &str, region: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            index_name: index_name.to_string(),
            region: region.to_string(),
            control_url: CONTROL_URL.to_string(),
            host: OnceCell::new(),
            ready_attempts: READY_POLL_ATTEMPTS,
            ready_interval: READY_POLL_INTERVAL,
        })
    }

    /// 컨트롤 플레인 주소 변경
    pub fn with_control_url(mut self, url: &str) -> Self {
        self.control_url = url.trim_end_matches('/').to_string();
        self
    }

    /// 인덱스 생성 후 준비 대기 횟수/간격
    pub fn with_ready_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.ready_attempts = attempts;
        self.ready_interval = interval;
        self
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
    }

    /// 인덱스 조회 (없으면 None)
    async fn describe_index(&self) -> Result<Option<IndexDescription>> {
        let url = format!("{}/indexes/{}", self.control_url, self.index_name);
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .context("Failed to describe Pinecone index")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let description = response
            .error_for_status()
            .context("Pinecone describe index failed")?
            .json::<IndexDescription>()
            .await
            .context("Failed to parse index description")?;

        Ok(Some(description))
    }

    /// 서버리스 인덱스 생성 (삭제 보호 활성)
    async fn create_index(&self, dimension: usize) -> Result<()> {
        let url = format!("{}/indexes", self.control_url);
        self.request(reqwest::Method::POST, &url)
            .json(&json!({
                "name": self.index_name,
                "dimension": dimension,
                "metric": "cosine",
                "spec": {
                    "serverless": { "cloud": "aws", "region": self.region }
                },
                "deletion_protection": "enabled",
            }))
            .send()
            .await
            .context("Failed to create Pinecone index")?
            .error_for_status()
            .context("Pinecone create index failed")?;

        tracing::info!("Created Pinecone index: {}", self.index_name);
        Ok(())
    }

    /// 데이터 플레인 주소 (캐시)
    async fn host(&self) -> Result<&str> {
        let host = self
            .host
            .get_or_try_init(|| async {
                let description = self
                    .describe_index()
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Pinecone index `{}` not found", self.index_name))?;
                Ok::<_, anyhow::Error>(data_plane_url(&description.host))
            })
            .await?;

        Ok(host.as_str())
    }

    /// 데이터 플레인 POST
    async fn post_data<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}{}", self.host().await?, path);
        self.request(reqwest::Method::POST, &url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Pinecone request failed: {}", path))?
            .error_for_status()
            .with_context(|| format!("Pinecone error response: {}", path))?
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse Pinecone response: {}", path))
    }

    /// 접두사로 ID 목록 조회 (페이지네이션)
    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/vectors/list", self.host().await?);
        let mut ids = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![("prefix", prefix.to_string()), ("limit", "100".to_string())];
            if let Some(t) = &token {
                query.push(("paginationToken", t.clone()));
            }

            let page = self
                .request(reqwest::Method::GET, &url)
                .query(&query)
                .send()
                .await
                .context("Failed to list Pinecone vectors")?
                .error_for_status()
                .context("Pinecone list failed")?
                .json::<ListResponse>()
                .await
                .context("Failed to parse list response")?;

            ids.extend(page.vectors.into_iter().map(|v| v.id));

            let next = page.pagination.and_then(|p| p.next);
            if next.is_some() && next == token {
                anyhow::bail!("Pinecone returned the same pagination token twice");
            }
            token = next;
            if token.is_none() {
                break;
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl VectorStore for PineconeVectorStore {
    async fn ensure_index(&self, dimension: usize) -> Result<()> {
        match self.describe_index().await? {
            Some(existing) => {
                if let Some(dim) = existing.dimension {
                    if dim != dimension {
                        anyhow::bail!(
                            "Pinecone index `{}` has dimension {}, expected {}",
                            self.index_name,
                            dim,
                            dimension
                        );
                    }
                }
                tracing::info!("Pinecone index `{}` already exists.", self.index_name);
            }
            None => {
                self.create_index(dimension).await?;

                // 준비 완료까지 대기
                let mut ready = false;
                for attempt in 0..self.ready_attempts {
                    if let Some(desc) = self.describe_index().await? {
                        if desc.status.ready {
                            ready = true;
                            break;
                        }
                    }
                    tracing::debug!("Waiting for index to be ready ({})", attempt + 1);
                    tokio::time::sleep(self.ready_interval).await;
                }
                if !ready {
                    anyhow::bail!(
                        "Pinecone index `{}` not ready after {} attempts",
                        self.index_name,
                        self.ready_attempts
                    );
                }
            }
        }

        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        let mut upserted = 0;

        for batch in records.chunks(UPSERT_BATCH) {
            let vectors: Vec<UpsertVector> = batch
                .iter()
                .map(|r| UpsertVector {
                    id: &r.id,
                    values: &r.embedding,
                    metadata: VectorMetadata {
                        source: r.source.clone(),
                        text: r.text.clone(),
                        chunk_index: r.chunk_index,
                    },
                })
                .collect();

            let _: serde_json::Value = self
                .post_data("/vectors/upsert", json!({ "vectors": vectors }))
                .await?;

            upserted += batch.len();
        }

        tracing::debug!("Upserted {} vectors into {}", upserted, self.index_name);
        Ok(upserted)
    }

    async fn similarity_search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        if k == 0 {
            return Ok(vec![]);
        }

        let response: QueryResponse = self
            .post_data(
                "/query",
                json!({
                    "vector": query_embedding,
                    "topK": k,
                    "includeMetadata": true,
                }),
            )
            .await?;

        Ok(matches_to_chunks(response.matches))
    }

    async fn delete_by_source(&self, source: &str) -> Result<usize> {
        let prefix = format!("{}#", source_prefix(source));
        let ids = self.list_ids(&prefix).await?;

        for batch in ids.chunks(1000) {
            let _: serde_json::Value = self
                .post_data("/vectors/delete", json!({ "ids": batch }))
                .await?;
        }

        Ok(ids.len())
    }

    async fn count(&self) -> Result<usize> {
        let stats: IndexStats = self.post_data("/describe_index_stats", json!({})).await?;
        Ok(stats.total_vector_count)
    }

    fn name(&self) -> &str {
        "pinecone"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 인덱스 호스트 -> 데이터 플레인 URL
fn data_plane_url(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    }
}

/// query 응답 -> RetrievedChunk (스코어 내림차순)
fn matches_to_chunks(matches: Vec<QueryMatch>) -> Vec<RetrievedChunk> {
    let mut chunks: Vec<RetrievedChunk> = matches
        .into_iter()
        .map(|m| {
            let metadata = m.metadata.unwrap_or_default();
            RetrievedChunk {
                id: m.id,
                source: metadata
                    .get("source")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                chunk_index: metadata
                    .get("chunk_index")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0) as i32,
                text: metadata
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                score: m.score,
            }
        })
        .collect();

    chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    chunks
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::vector::record_id;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeIndex {
        host: String,
        created: Option<Value>,
        vectors: Vec<Value>,
        deleted: Vec<String>,
        never_ready: bool,
        list_calls: usize,
    }

    /// 목록 조회 페이지 크기
    const LIST_PAGE: usize = 2;

    type Shared = Arc<Mutex<FakeIndex>>;

    async fn describe(State(state): State<Shared>) -> Result<Json<Value>, StatusCode> {
        let index = state.lock().unwrap();
        match &index.created {
            Some(body) => Ok(Json(json!({
                "host": index.host,
                "dimension": body["dimension"],
                "status": { "ready": !index.never_ready }
            }))),
            None => Err(StatusCode::NOT_FOUND),
        }
    }

    async fn create(State(state): State<Shared>, Json(body): Json<Value>) -> StatusCode {
        state.lock().unwrap().created = Some(body);
        StatusCode::CREATED
    }

    async fn upsert(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        let mut index = state.lock().unwrap();
        let vectors = body["vectors"].as_array().cloned().unwrap_or_default();
        let count = vectors.len();
        index.vectors.extend(vectors);
        Json(json!({ "upsertedCount": count }))
    }

    async fn query(State(state): State<Shared>) -> Json<Value> {
        let index = state.lock().unwrap();
        let matches: Vec<Value> = index
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| json!({ "id": v["id"], "score": 0.5 + i as f32 * 0.1, "metadata": v["metadata"] }))
            .collect();
        Json(json!({ "matches": matches }))
    }

    async fn stats(State(state): State<Shared>) -> Json<Value> {
        Json(json!({ "totalVectorCount": state.lock().unwrap().vectors.len() }))
    }

    async fn list(
        State(state): State<Shared>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        let prefix = params.get("prefix").cloned().unwrap_or_default();
        let offset: usize = params
            .get("paginationToken")
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let mut index = state.lock().unwrap();
        index.list_calls += 1;
        let matching: Vec<&str> = index
            .vectors
            .iter()
            .filter_map(|v| v["id"].as_str())
            .filter(|id| id.starts_with(&prefix))
            .collect();

        let end = (offset + LIST_PAGE).min(matching.len());
        let ids: Vec<Value> = matching[offset.min(end)..end]
            .iter()
            .map(|id| json!({ "id": id }))
            .collect();

        if end < matching.len() {
            Json(json!({ "vectors": ids, "pagination": { "next": end.to_string() } }))
        } else {
            Json(json!({ "vectors": ids }))
        }
    }

    async fn delete(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        let mut index = state.lock().unwrap();
        let ids: Vec<String> = body["ids"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        index.vectors.retain(|v| !ids.iter().any(|id| v["id"] == *id));
        index.deleted.extend(ids);
        Json(json!({}))
    }

    async fn spawn_fake() -> (String, Shared) {
        let state: Shared = Arc::new(Mutex::new(FakeIndex::default()));
        let app = Router::new()
            .route("/indexes", post(create))
            .route("/indexes/:name", get(describe))
            .route("/vectors/upsert", post(upsert))
            .route("/vectors/list", get(list))
            .route("/vectors/delete", post(delete))
            .route("/query", post(query))
            .route("/describe_index_stats", post(stats))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        state.lock().unwrap().host = base.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (base, state)
    }

    fn record(source: &str, chunk_index: i32) -> VectorRecord {
        VectorRecord {
            id: record_id(source, chunk_index),
            source: source.to_string(),
            chunk_index,
            text: format!("text {}", chunk_index),
            embedding: vec![0.1, 0.2],
        }
    }

    #[test]
    fn test_data_plane_url() {
        assert_eq!(data_plane_url("idx-abc.svc.pinecone.io"), "https://idx-abc.svc.pinecone.io");
        assert_eq!(data_plane_url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_matches_to_chunks_sorted_with_unknown_source() {
        let matches = vec![
            QueryMatch {
                id: "a".to_string(),
                score: 0.2,
                metadata: Some(json!({ "text": "low", "chunk_index": 1 })),
            },
            QueryMatch {
                id: "b".to_string(),
                score: 0.9,
                metadata: Some(json!({ "text": "high", "source": "b.md" })),
            },
        ];

        let chunks = matches_to_chunks(matches);
        assert_eq!(chunks[0].id, "b");
        assert_eq!(chunks[0].source.as_deref(), Some("b.md"));
        assert_eq!(chunks[1].source, None);
        assert_eq!(chunks[1].chunk_index, 1);
    }

    #[tokio::test]
    async fn test_ensure_index_creates_with_protection() {
        let (base, state) = spawn_fake().await;
        let store = PineconeVectorStore::new("key".to_string(), "docs-512", "us-east-1")
            .unwrap()
            .with_control_url(&base);

        store.ensure_index(512).await.unwrap();

        let created = state.lock().unwrap().created.clone().unwrap();
        assert_eq!(created["metric"], "cosine");
        assert_eq!(created["dimension"], 512);
        assert_eq!(created["deletion_protection"], "enabled");
        assert_eq!(created["spec"]["serverless"]["region"], "us-east-1");

        // 차원이 다르면 실패
        assert!(store.ensure_index(256).await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_query_count_delete() {
        let (base, _state) = spawn_fake().await;
        let store = PineconeVectorStore::new("key".to_string(), "docs-2", "us-east-1")
            .unwrap()
            .with_control_url(&base);
        store.ensure_index(2).await.unwrap();

        let records = vec![record("a.md", 0), record("a.md", 1), record("b.md", 0)];
        assert_eq!(store.upsert(&records).await.unwrap(), 3);
        assert_eq!(store.count().await.unwrap(), 3);

        let hits = store.similarity_search(&[0.1, 0.2], 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits[0].score >= hits[1].score);
        assert_eq!(hits[0].source.as_deref(), Some("b.md"));

        assert_eq!(store.delete_by_source("a.md").await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ensure_index_fails_when_never_ready() {
        let (base, state) = spawn_fake().await;
        state.lock().unwrap().never_ready = true;
        let store = PineconeVectorStore::new("key".to_string(), "docs-2", "us-east-1")
            .unwrap()
            .with_control_url(&base)
            .with_ready_poll(3, Duration::from_millis(1));

        let err = store.ensure_index(2).await.unwrap_err();
        assert!(format!("{:#}", err).contains("not ready after 3 attempts"));
    }

    #[tokio::test]
    async fn test_delete_by_source_follows_pages() {
        let (base, state) = spawn_fake().await;
        let store = PineconeVectorStore::new("key".to_string(), "docs-2", "us-east-1")
            .unwrap()
            .with_control_url(&base);
        store.ensure_index(2).await.unwrap();

        let mut records: Vec<VectorRecord> = (0..5).map(|i| record("big.md", i)).collect();
        records.push(record("other.md", 0));
        store.upsert(&records).await.unwrap();

        assert_eq!(store.delete_by_source("big.md").await.unwrap(), 5);

        let index = state.lock().unwrap();
        assert_eq!(index.list_calls, 3);
        assert_eq!(index.deleted.len(), 5);
        assert_eq!(index.vectors.len(), 1);
        assert_eq!(index.vectors[0]["id"], record_id("other.md", 0));
    }
}
