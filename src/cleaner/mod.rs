//! HTML 정리 모듈 - 원본 HTML을 RAG용 텍스트/Markdown으로 변환
//!
//! 스크립트/스타일/내비게이션 등 본문 외 요소를 제거하고,
//! `<pre>` 코드 블록은 들여쓰기를 보존한 펜스 블록으로 바꿉니다.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Node, Selector};
use walkdir::WalkDir;

/// 제거 대상 태그
const STRIP_TAGS: [&str; 5] = ["script", "style", "nav", "footer", "header"];

/// 기본 본문 셀렉터 (MOOSE 기반 문서 사이트)
pub const DEFAULT_CONTENT_SELECTOR: &str = "div.moose-content";

// ============================================================================
// Configuration
// ============================================================================

/// 출력 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// 일반 텍스트 (.txt, 줄 양쪽 공백 제거)
    Text,
    /// Markdown (.md, 줄 끝 공백만 제거)
    #[default]
    Markdown,
}

impl OutputFormat {
    /// 출력 파일 확장자
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Markdown => "md",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "markdown" | "md" => Ok(Self::Markdown),
            other => anyhow::bail!("Unknown output format: {} (text | markdown)", other),
        }
    }
}

/// 정리 설정
#[derive(Debug, Clone)]
pub struct CleanConfig {
    /// 본문 영역 CSS 셀렉터 (없으면 문서 전체)
    pub content_selector: String,
    pub format: OutputFormat,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            content_selector: DEFAULT_CONTENT_SELECTOR.to_string(),
            format: OutputFormat::Markdown,
        }
    }
}

/// 일괄 정리 결과
#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    pub cleaned: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

// ============================================================================
// Extraction
// ============================================================================

/// HTML에서 정리된 텍스트 추출
pub fn extract_clean_text(html: &str, config: &CleanConfig) -> String {
    let document = Html::parse_document(html);

    let root = Selector::parse(&config.content_selector)
        .ok()
        .and_then(|selector| document.select(&selector).next())
        .unwrap_or_else(|| document.root_element());

    let mut pieces: Vec<String> = Vec::new();
    collect_text(root, &mut pieces);

    normalize_lines(&pieces.join("\n"), config.format)
}

/// 페이지 제목 추출 (`<title>` -> 첫 `<h1>`)
pub fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    for tag in ["title", "h1"] {
        if let Ok(selector) = Selector::parse(tag) {
            if let Some(element) = document.select(&selector).next() {
                let title = element.text().collect::<String>().trim().to_string();
                if !title.is_empty() {
                    return Some(title);
                }
            }
        }
    }

    None
}

/// 요소 트리를 순회하며 텍스트 조각 수집
fn collect_text(element: ElementRef, pieces: &mut Vec<String>) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => pieces.push(text.text.to_string()),
            Node::Element(el) => {
                let name = el.name();
                if STRIP_TAGS.contains(&name) {
                    continue;
                }

                let Some(child_ref) = ElementRef::wrap(child) else {
                    continue;
                };

                if name == "pre" {
                    pieces.push(code_block(child_ref));
                } else {
                    collect_text(child_ref, pieces);
                }
            }
            _ => {}
        }
    }
}

/// `<pre>`를 펜스 코드 블록으로 변환 (공백 보존)
fn code_block(pre: ElementRef) -> String {
    let code_tag = Selector::parse("code")
        .ok()
        .and_then(|selector| pre.select(&selector).next())
        .unwrap_or(pre);

    let code: String = code_tag.text().collect();
    format!("\n```text\n{}\n```\n", code.trim_end())
}

/// 빈 줄 제거 + 줄 단위 공백 정리
///
/// 코드 펜스 내부는 형식과 무관하게 줄 끝 공백만 제거합니다.
fn normalize_lines(text: &str, format: OutputFormat) -> String {
    let mut lines = Vec::new();
    let mut in_code_block = false;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let is_fence = line.trim_start().starts_with("```");

        let cleaned = if is_fence {
            line.trim()
        } else if in_code_block || format == OutputFormat::Markdown {
            line.trim_end()
        } else {
            line.trim()
        };

        if is_fence {
            in_code_block = !in_code_block;
        }

        lines.push(cleaned);
    }

    lines.join("\n")
}

// ============================================================================
// Batch Processing
// ============================================================================

/// 입력 폴더의 모든 HTML을 정리하여 출력 폴더에 저장
///
/// 폴더 구조는 그대로 유지하고 확장자만 바꿉니다.
pub fn clean_all_html(input_dir: &Path, output_dir: &Path, config: &CleanConfig) -> Result<CleanReport> {
    if !input_dir.is_dir() {
        anyhow::bail!("Input directory not found: {}", input_dir.display());
    }
    if let Err(e) = Selector::parse(&config.content_selector) {
        anyhow::bail!("Invalid content selector `{}`: {:?}", config.content_selector, e);
    }

    let mut report = CleanReport::default();

    for entry in WalkDir::new(input_dir).sort_by_file_name() {
        let entry = entry.context("Failed to walk input directory")?;
        let path = entry.path();

        if !entry.file_type().is_file()
            || path.extension().and_then(|e| e.to_str()) != Some("html")
        {
            continue;
        }

        match clean_file(path, input_dir, output_dir, config) {
            Ok(output_path) => {
                tracing::info!("Cleaned {}", output_path.display());
                report.cleaned.push(output_path);
            }
            Err(e) => {
                tracing::error!("Failed to clean {}: {:#}", path.display(), e);
                report.failed.push((path.to_path_buf(), format!("{:#}", e)));
            }
        }
    }

    Ok(report)
}

/// 단일 파일 정리
fn clean_file(path: &Path, input_dir: &Path, output_dir: &Path, config: &CleanConfig) -> Result<PathBuf> {
    let html = std::fs::read_to_string(path).context("Failed to read HTML file")?;
    let clean_text = extract_clean_text(&html, config);

    let relative = path
        .strip_prefix(input_dir)
        .context("File is outside the input directory")?;
    let output_path = output_dir
        .join(relative)
        .with_extension(config.format.extension());

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create output directory")?;
    }

    std::fs::write(&output_path, clean_text).context("Failed to write cleaned file")?;
    Ok(output_path)
}

// ============================================================================
// Tests
// ============================================================================
