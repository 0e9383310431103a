//! 설정 모듈 - 환경변수 기반 런타임 설정
//!
//! `.env` 파일은 main에서 dotenvy로 먼저 로드됩니다.
//! 모든 값은 기본값을 가지며, API 키만 필수입니다.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

/// 기본 채팅 모델
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4.1-nano-2025-04-14";
/// 기본 임베딩 모델
pub const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";
/// 기본 임베딩 차원
pub const DEFAULT_EMBED_DIM: usize = 512;
/// OpenAI 호환 API 기본 주소
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

// ============================================================================
// Vector Backend
// ============================================================================

/// 벡터 저장소 백엔드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    /// 로컬 LanceDB (기본값)
    Lance,
    /// Pinecone 서버리스 인덱스
    Pinecone,
}

impl FromStr for VectorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "lance" | "lancedb" => Ok(Self::Lance),
            "pinecone" => Ok(Self::Pinecone),
            other => anyhow::bail!("Unknown vector backend: {} (lance | pinecone)", other),
        }
    }
}

impl VectorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lance => "lance",
            Self::Pinecone => "pinecone",
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// 런타임 설정
#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_base_url: String,
    pub chat_model: String,
    pub temperature: f32,
    pub embed_model: String,
    pub embed_dimension: usize,
    pub vector_backend: VectorBackend,
    pub pinecone_region: String,
    pub index_name: String,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub max_history_messages: usize,
    pub data_dir: PathBuf,
    pub site_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            temperature: 0.2,
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            embed_dimension: DEFAULT_EMBED_DIM,
            vector_backend: VectorBackend::Lance,
            pinecone_region: "us-east-1".to_string(),
            index_name: format!("docs-{}", DEFAULT_EMBED_DIM),
            top_k: 4,
            max_context_chars: 12_000,
            max_history_messages: 20,
            data_dir: get_data_dir(),
            site_name: "RACCOON".to_string(),
        }
    }
}

impl Settings {
    /// 환경변수에서 설정 로드
    ///
    /// 숫자 파싱 실패는 변수 이름과 함께 에러로 보고합니다.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let embed_dimension = env_parse("DOCQA_EMBED_DIM", defaults.embed_dimension)?;
        let index_name = env_string("DOCQA_INDEX_NAME")
            .unwrap_or_else(|| format!("docs-{}", embed_dimension));

        Ok(Self {
            openai_base_url: env_string("OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.openai_base_url),
            chat_model: env_string("DOCQA_CHAT_MODEL").unwrap_or(defaults.chat_model),
            temperature: env_parse("DOCQA_TEMPERATURE", defaults.temperature)?,
            embed_model: env_string("DOCQA_EMBED_MODEL").unwrap_or(defaults.embed_model),
            embed_dimension,
            vector_backend: env_parse("DOCQA_VECTOR_BACKEND", defaults.vector_backend)?,
            pinecone_region: env_string("PINECONE_REGION").unwrap_or(defaults.pinecone_region),
            index_name,
            top_k: env_parse("DOCQA_TOP_K", defaults.top_k)?,
            max_context_chars: env_parse("DOCQA_MAX_CONTEXT_CHARS", defaults.max_context_chars)?,
            max_history_messages: env_parse(
                "DOCQA_MAX_HISTORY_MESSAGES",
                defaults.max_history_messages,
            )?,
            data_dir: defaults.data_dir,
            site_name: env_string("DOCQA_SITE_NAME").unwrap_or(defaults.site_name),
        })
    }

    /// LanceDB 디렉토리
    pub fn lance_path(&self) -> PathBuf {
        self.data_dir.join("vectors.lance")
    }

    /// 대화 기록 DB 경로
    pub fn threads_db_path(&self) -> PathBuf {
        self.data_dir.join("threads.db")
    }
}

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.docqa/)
///
/// `DOCQA_DATA_DIR`이 설정되어 있으면 우선 사용합니다.
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = env_string("DOCQA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docqa")
}

// ============================================================================
// API Key Management
// ============================================================================

/// OpenAI API 키 로드
pub fn get_api_key() -> Result<String> {
    env_string("OPENAI_API_KEY").ok_or_else(|| {
        anyhow::anyhow!(
            "API key not found. Set OPENAI_API_KEY environment variable (or add it to .env)."
        )
    })
}

/// OpenAI API 키 존재 여부
pub fn has_api_key() -> bool {
    env_string("OPENAI_API_KEY").is_some()
}

/// Pinecone API 키 로드
pub fn get_pinecone_api_key() -> Result<String> {
    env_string("PINECONE_API_KEY")
        .ok_or_else(|| anyhow::anyhow!("PINECONE_API_KEY not set (required for pinecone backend)"))
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 비어있지 않은 환경변수 값
fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 환경변수 파싱 (없으면 기본값)
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        None => Ok(default),
    }
}

// ============================================================================
// Tests
// ============================================================================
