//! Text Chunking Module
//!
//! Markdown 구조 경계를 우선하는 재귀 분할기입니다.
//! 헤더 -> 코드 펜스 -> 수평선 -> 문단 -> 줄 -> 단어 -> 문자 순으로
//! 구분자를 바꿔가며, 청크 크기를 넘는 조각만 다시 쪼갭니다.
//! 길이는 모두 문자(char) 수 기준입니다.

use regex::Regex;

/// Markdown 구분자 (우선순위 순, 정규식)
const MARKDOWN_SEPARATORS: [&str; 9] = [
    r"\n#{1,6} ",
    r"```\n",
    r"\n\*\*\*+\n",
    r"\n---+\n",
    r"\n___+\n",
    r"\n\n",
    r"\n",
    r" ",
    "",
];

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// 최대 청크 크기 (문자 수)
    pub chunk_size: usize,
    /// 인접 청크 간 오버랩 (문자 수)
    pub chunk_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 100,
        }
    }
}

impl ChunkConfig {
    /// 설정 검증
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than 0");
        }
        if self.chunk_overlap >= self.chunk_size {
            anyhow::bail!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap,
                self.chunk_size
            );
        }
        Ok(())
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    fn chunk(&self, text: &str) -> Vec<String>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// MarkdownChunker
// ============================================================================

/// Markdown 인식 재귀 청커
pub struct MarkdownChunker {
    config: ChunkConfig,
    separators: Vec<Regex>,
}

impl MarkdownChunker {
    /// 설정으로 생성
    pub fn new(config: ChunkConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let separators = MARKDOWN_SEPARATORS
            .iter()
            .map(|s| Regex::new(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { config, separators })
    }

    /// 기본 설정으로 생성 (1000자 / 오버랩 100자)
    pub fn with_defaults() -> Self {
        let separators = MARKDOWN_SEPARATORS
            .iter()
            .filter_map(|s| Regex::new(s).ok())
            .collect();

        Self {
            config: ChunkConfig::default(),
            separators,
        }
    }

    /// 재귀 분할
    ///
    /// `separators[level..]` 중 텍스트에 처음 등장하는 구분자로 나누고,
    /// 여전히 긴 조각은 다음 구분자로 다시 나눕니다.
    fn split_recursive(&self, text: &str, level: usize) -> Vec<String> {
        let mut final_chunks = Vec::new();

        // 사용할 구분자 선택 (빈 구분자 = 문자 단위)
        let mut chosen = self.separators.len() - 1;
        for (i, re) in self.separators.iter().enumerate().skip(level) {
            if re.as_str().is_empty() || re.is_match(text) {
                chosen = i;
                break;
            }
        }
        let has_next = chosen + 1 < self.separators.len();

        let splits = split_keep_separator(text, &self.separators[chosen]);

        let mut good_splits: Vec<String> = Vec::new();
        for piece in splits {
            if char_len(&piece) < self.config.chunk_size {
                good_splits.push(piece);
                continue;
            }

            if !good_splits.is_empty() {
                final_chunks.extend(self.merge_splits(&good_splits));
                good_splits.clear();
            }

            if has_next {
                final_chunks.extend(self.split_recursive(&piece, chosen + 1));
            } else {
                final_chunks.push(piece);
            }
        }

        if !good_splits.is_empty() {
            final_chunks.extend(self.merge_splits(&good_splits));
        }

        final_chunks
    }

    /// 작은 조각들을 청크 크기까지 병합 (오버랩 유지)
    fn merge_splits(&self, splits: &[String]) -> Vec<String> {
        let size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;

        let mut docs = Vec::new();
        let mut current: std::collections::VecDeque<&str> = std::collections::VecDeque::new();
        let mut total = 0usize;

        for piece in splits {
            let len = char_len(piece);

            if total + len > size && !current.is_empty() {
                if total > size {
                    tracing::warn!("Created a chunk of size {}, which is longer than {}", total, size);
                }

                if let Some(doc) = join_pieces(&current) {
                    docs.push(doc);
                }

                // 오버랩 범위만 남기고 앞에서부터 제거
                while total > overlap || (total + len > size && total > 0) {
                    match current.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }

            current.push_back(piece);
            total += len;
        }

        if let Some(doc) = join_pieces(&current) {
            docs.push(doc);
        }

        docs
    }
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return vec![];
        }

        self.split_recursive(text, 0)
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .collect()
    }

    fn name(&self) -> &'static str {
        "MarkdownChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 문자 수
#[inline]
fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// 구분자를 다음 조각의 앞에 붙인 채로 분할
///
/// 빈 구분자는 문자 단위 분할입니다. 빈 조각은 버립니다.
fn split_keep_separator(text: &str, separator: &Regex) -> Vec<String> {
    if separator.as_str().is_empty() {
        return text.chars().map(|c| c.to_string()).collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;

    for m in separator.find_iter(text) {
        if m.start() > start {
            pieces.push(text[start..m.start()].to_string());
        }
        start = m.start();
    }

    if start < text.len() {
        pieces.push(text[start..].to_string());
    }

    pieces.retain(|p| !p.is_empty());
    pieces
}

/// 조각 연결 + 양끝 공백 제거 (비면 None)
fn join_pieces(pieces: &std::collections::VecDeque<&str>) -> Option<String> {
    let joined: String = pieces.iter().copied().collect();
    let trimmed = joined.trim();

    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 기본 청커 생성
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(MarkdownChunker::with_defaults())
}

/// Markdown 청커 생성 (설정 지정)
pub fn markdown_chunker(config: ChunkConfig) -> anyhow::Result<Box<dyn Chunker>> {
    Ok(Box::new(MarkdownChunker::new(config)?))
}

// ============================================================================
// Tests
// ============================================================================
