//! docqa - 문서 사이트 질의응답 어시스턴트
//!
//! 문서 사이트를 크롤링/정리/청킹하여 벡터 인덱스(LanceDB 또는 Pinecone)에
//! 적재하고, 검색 도구를 쓰는 에이전트가 근거 기반 답변을 생성합니다.
//! 대화는 스레드 단위로 저장되어 웹 UI와 CLI에서 이어갈 수 있습니다.

pub mod agent;
pub mod cleaner;
pub mod cli;
pub mod config;
pub mod crawler;
pub mod embedding;
pub mod knowledge;
pub mod llm;
pub mod openai;
pub mod web;

// Re-exports
pub use agent::{AgentEvent, AgentOptions, Checkpointer, DocsAgent, MemoryCheckpointer, SqliteCheckpointer};
pub use config::{get_api_key, get_data_dir, has_api_key, Settings, VectorBackend};
pub use embedding::{EmbeddingProvider, OpenAiEmbedding};
pub use knowledge::{
    default_chunker, markdown_chunker, ChunkConfig, Chunker, Ingestor, LanceVectorStore,
    MarkdownChunker, PineconeVectorStore, RetrievedChunk, VectorStore,
};
pub use llm::{ChatMessage, ChatModel, OpenAiChat};
