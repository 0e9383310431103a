//! CLI 모듈
//!
//! docqa CLI 명령어 정의 및 구현

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::agent::{
    flow_diagram, AgentEvent, AgentOptions, Checkpointer, DocsAgent, RetrieveTool, SqliteCheckpointer,
};
use crate::cleaner::{clean_all_html, CleanConfig, OutputFormat, DEFAULT_CONTENT_SELECTOR};
use crate::config::{has_api_key, Settings};
use crate::crawler::{CrawlConfig, DocCrawler};
use crate::embedding::create_embedder;
use crate::knowledge::{markdown_chunker, open_vector_store, ChunkConfig, Ingestor};
use crate::llm::{create_chat_model, Role};
use crate::web::{self, AppState};

/// 기본 크롤링 시작 주소
const DEFAULT_BASE_URL: &str = "https://hugary1995.github.io/raccoon/index.html";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "docqa")]
#[command(version, about = "문서 사이트 질의응답 어시스턴트 (RAG)", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 문서 사이트 크롤링 + HTML 저장
    Crawl {
        /// 시작 URL
        #[arg(short, long, default_value = DEFAULT_BASE_URL)]
        base_url: String,

        /// 사이트 접두사 (기본: 시작 URL의 디렉토리)
        #[arg(long)]
        site_prefix: Option<String>,

        /// HTML 저장 폴더
        #[arg(short, long, default_value = "data/raw_html")]
        out: PathBuf,

        /// 최대 페이지 수
        #[arg(long)]
        max_pages: Option<usize>,
    },

    /// HTML을 텍스트/Markdown으로 정리
    Clean {
        /// HTML 폴더
        #[arg(short, long, default_value = "data/raw_html")]
        input: PathBuf,

        /// 출력 폴더
        #[arg(short, long, default_value = "data/clean")]
        out: PathBuf,

        /// 출력 형식 (text | markdown)
        #[arg(short, long, default_value = "markdown")]
        format: OutputFormat,

        /// 본문 CSS 셀렉터
        #[arg(short, long, default_value = DEFAULT_CONTENT_SELECTOR)]
        selector: String,
    },

    /// Markdown 폴더를 청킹/임베딩하여 벡터 인덱스에 적재
    Ingest {
        /// Markdown 폴더 (재귀)
        #[arg(short, long, default_value = "data/clean")]
        dir: PathBuf,

        /// 청크 크기 (문자)
        #[arg(long, default_value = "1000")]
        chunk_size: usize,

        /// 청크 오버랩 (문자)
        #[arg(long, default_value = "100")]
        chunk_overlap: usize,
    },

    /// 질문 한 번 (답변 스트리밍)
    Ask {
        /// 질문
        question: String,

        /// 이어갈 스레드 ID (기본: 새 스레드)
        #[arg(short, long)]
        thread: Option<String>,
    },

    /// 대화형 채팅
    Chat {
        /// 이어갈 스레드 ID (기본: 새 스레드)
        #[arg(short, long)]
        thread: Option<String>,
    },

    /// 웹 UI 서버 실행
    Serve {
        /// 바인드 주소
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        addr: SocketAddr,
    },

    /// 대화 스레드 관리
    Threads {
        #[command(subcommand)]
        action: ThreadAction,
    },

    /// 상태 확인
    Status,

    /// 에이전트 흐름도 출력 (Mermaid)
    Graph,
}

#[derive(Subcommand)]
pub enum ThreadAction {
    /// 스레드 목록
    List,
    /// 스레드 대화 출력
    Show { id: String },
    /// 스레드 삭제
    Delete { id: String },
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl {
            base_url,
            site_prefix,
            out,
            max_pages,
        } => cmd_crawl(&base_url, site_prefix.as_deref(), &out, max_pages).await,
        Commands::Clean {
            input,
            out,
            format,
            selector,
        } => cmd_clean(&input, &out, format, selector),
        Commands::Ingest {
            dir,
            chunk_size,
            chunk_overlap,
        } => cmd_ingest(&dir, chunk_size, chunk_overlap).await,
        Commands::Ask { question, thread } => cmd_ask(&question, thread).await,
        Commands::Chat { thread } => cmd_chat(thread).await,
        Commands::Serve { addr } => cmd_serve(addr).await,
        Commands::Threads { action } => cmd_threads(action).await,
        Commands::Status => cmd_status().await,
        Commands::Graph => {
            println!("{}", flow_diagram());
            Ok(())
        }
    }
}

/// 크롤링 명령어 (crawl)
async fn cmd_crawl(
    base_url: &str,
    site_prefix: Option<&str>,
    out: &Path,
    max_pages: Option<usize>,
) -> Result<()> {
    let mut config = CrawlConfig::new(base_url)?;
    if let Some(prefix) = site_prefix {
        config = config.with_site_prefix(prefix)?;
    }
    if let Some(max) = max_pages {
        config = config.with_max_pages(max);
    }

    println!("[*] 크롤링 시작: {}", config.base_url);
    println!("[*] 사이트 범위: {}", config.site_prefix);

    let crawler = DocCrawler::new(config)?;
    let links = crawler.crawl().await.context("크롤링 실패")?;

    if links.is_empty() {
        println!("[!] 수집된 페이지가 없습니다.");
        return Ok(());
    }

    println!("[OK] {} 페이지 발견, 다운로드 중...", links.len());

    let report = crawler.download_all(&links, out).await;
    let total_bytes: u64 = report
        .saved
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

    println!(
        "[OK] 저장 완료: {} 파일 ({}) -> {}",
        report.saved.len(),
        format_bytes(total_bytes as usize),
        out.display()
    );
    if !report.failed.is_empty() {
        println!("[!] 실패: {} 페이지", report.failed.len());
        for url in &report.failed {
            println!("    - {}", url);
        }
    }

    Ok(())
}

/// 정리 명령어 (clean)
fn cmd_clean(input: &Path, out: &Path, format: OutputFormat, selector: String) -> Result<()> {
    let config = CleanConfig {
        content_selector: selector,
        format,
    };

    println!("[*] HTML 정리 중: {} -> {}", input.display(), out.display());

    let report = clean_all_html(input, out, &config)?;

    println!("[OK] 정리 완료: {} 파일 (.{})", report.cleaned.len(), format.extension());
    if !report.failed.is_empty() {
        println!("[!] 실패: {} 파일", report.failed.len());
        for (path, error) in &report.failed {
            println!("    - {}: {}", path.display(), truncate_text(error, 120));
        }
    }

    Ok(())
}

/// 적재 명령어 (ingest)
async fn cmd_ingest(dir: &Path, chunk_size: usize, chunk_overlap: usize) -> Result<()> {
    require_api_key()?;
    let settings = Settings::from_env()?;

    let chunker = markdown_chunker(ChunkConfig {
        chunk_size,
        chunk_overlap,
    })?;
    let embedder = Arc::new(create_embedder(&settings)?);
    let store = open_vector_store(&settings).await?;

    println!(
        "[*] 적재 중: {} -> {} ({})",
        dir.display(),
        settings.index_name,
        store.name()
    );

    let ingestor = Ingestor::new(embedder, store.clone(), chunker);
    let report = ingestor.ingest_folder(dir).await.context("적재 실패")?;

    println!(
        "[OK] {} 파일, {} 청크 적재 (교체된 기존 청크: {})",
        report.files, report.upserted, report.replaced
    );
    println!("[OK] 인덱스 전체: {} 청크", store.count().await?);

    Ok(())
}

/// 질문 명령어 (ask)
async fn cmd_ask(question: &str, thread: Option<String>) -> Result<()> {
    require_api_key()?;
    let settings = Settings::from_env()?;
    let agent = build_agent(&settings).await?;

    let thread_id = thread.unwrap_or_else(new_thread_id);
    println!("[*] 스레드: {}\n", thread_id);

    print_turn(&agent, &thread_id, question).await
}

/// 대화형 명령어 (chat)
async fn cmd_chat(thread: Option<String>) -> Result<()> {
    require_api_key()?;
    let settings = Settings::from_env()?;
    let agent = build_agent(&settings).await?;

    let thread_id = thread.unwrap_or_else(new_thread_id);
    println!("[*] 스레드: {} (종료: exit)", thread_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("입력 읽기 실패")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        if let Err(e) = print_turn(&agent, &thread_id, line).await {
            println!("[!] {:#}", e);
        }
    }

    Ok(())
}

/// 서버 명령어 (serve)
async fn cmd_serve(addr: SocketAddr) -> Result<()> {
    require_api_key()?;
    let settings = Settings::from_env()?;
    let agent = build_agent(&settings).await?;

    println!("[OK] 웹 UI: http://{}", addr);
    web::serve(addr, AppState { agent }).await
}

/// 스레드 명령어 (threads)
async fn cmd_threads(action: ThreadAction) -> Result<()> {
    let settings = Settings::from_env()?;
    let checkpointer = SqliteCheckpointer::open(&settings.threads_db_path())?;

    match action {
        ThreadAction::List => {
            let threads = checkpointer.list_threads().await?;
            if threads.is_empty() {
                println!("[!] 저장된 스레드가 없습니다.");
                return Ok(());
            }

            println!("[OK] 스레드 ({} 건):\n", threads.len());
            for t in threads {
                println!(
                    "{}  {}  [{} 메시지]  {}",
                    t.id,
                    t.updated_at.format("%Y-%m-%d %H:%M"),
                    t.message_count,
                    truncate_text(&t.title, 50)
                );
            }
        }
        ThreadAction::Show { id } => {
            let messages = checkpointer.load(&id).await?;
            if messages.is_empty() {
                bail!("스레드를 찾을 수 없습니다: {}", id);
            }

            for m in messages {
                match m.role {
                    Role::User => println!("\n[user] {}", m.content),
                    Role::Assistant if m.is_tool_request() => {
                        for call in &m.tool_calls {
                            println!("[tool call] {}({})", call.name, call.arguments);
                        }
                    }
                    Role::Assistant => println!("[assistant] {}", m.content),
                    Role::Tool => println!("[tool] {}", truncate_text(&m.content, 120)),
                    Role::System => println!("[system] {}", truncate_text(&m.content, 120)),
                }
            }
        }
        ThreadAction::Delete { id } => {
            if checkpointer.delete_thread(&id).await? {
                println!("[OK] 스레드 삭제됨: {}", id);
            } else {
                println!("[!] 삭제할 스레드를 찾을 수 없습니다: {}", id);
            }
        }
    }

    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status() -> Result<()> {
    let settings = Settings::from_env()?;

    println!("[*] 데이터 디렉토리: {}", settings.data_dir.display());
    println!("[*] 채팅 모델: {} (temperature {})", settings.chat_model, settings.temperature);
    println!(
        "[*] 임베딩 모델: {} ({} 차원)",
        settings.embed_model, settings.embed_dimension
    );
    println!(
        "[*] 벡터 백엔드: {} / 인덱스: {}",
        settings.vector_backend.as_str(),
        settings.index_name
    );

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정 (OPENAI_API_KEY)");
    }

    match open_vector_store(&settings).await {
        Ok(store) => match store.count().await {
            Ok(count) => println!("[OK] 벡터 인덱스: {} 청크", count),
            Err(e) => println!("[!] 벡터 인덱스 조회 실패: {:#}", e),
        },
        Err(e) => println!("[!] 벡터 저장소 열기 실패: {:#}", e),
    }

    let db_path = settings.threads_db_path();
    match SqliteCheckpointer::open(&db_path) {
        Ok(checkpointer) => {
            let threads = checkpointer.list_threads().await?;
            let size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
            println!(
                "[OK] 대화 스레드: {} 건 ({})",
                threads.len(),
                format_bytes(size as usize)
            );
        }
        Err(e) => println!("[!] 스레드 DB 열기 실패: {:#}", e),
    }

    Ok(())
}

// ============================================================================
// Agent Helpers
// ============================================================================

/// 설정으로 에이전트 구성
async fn build_agent(settings: &Settings) -> Result<DocsAgent> {
    let embedder = Arc::new(create_embedder(settings)?);
    let store = open_vector_store(settings).await?;
    let model = Arc::new(create_chat_model(settings)?);
    let checkpointer = Arc::new(SqliteCheckpointer::open(&settings.threads_db_path())?);

    let tool = RetrieveTool::new(embedder, store, settings.top_k, &settings.site_name);
    let options = AgentOptions {
        site_name: settings.site_name.clone(),
        max_context_chars: settings.max_context_chars,
        max_history_messages: settings.max_history_messages,
    };

    Ok(DocsAgent::new(model, tool, checkpointer, options))
}

/// 한 턴을 실행하며 콘솔에 출력
async fn print_turn(agent: &DocsAgent, thread_id: &str, question: &str) -> Result<()> {
    let mut rx = agent.run_turn(thread_id, question);
    let mut sources: Vec<String> = Vec::new();

    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Token(text) => {
                print!("{}", text);
                std::io::stdout().flush().ok();
            }
            AgentEvent::ToolCall { name, query } => {
                println!("[*] {}: \"{}\"", name, query);
            }
            AgentEvent::Sources(hits) => {
                for hit in hits {
                    sources.push(format!(
                        "{} ({:.3})",
                        hit.source.as_deref().unwrap_or("unknown"),
                        hit.score
                    ));
                }
            }
            AgentEvent::Done { .. } => {
                println!();
                if !sources.is_empty() {
                    println!("\n[OK] 출처:");
                    for s in &sources {
                        println!("    - {}", s);
                    }
                }
            }
            AgentEvent::Error(message) => bail!("답변 실패: {}", message),
        }
    }

    Ok(())
}

fn require_api_key() -> Result<()> {
    if !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\
             설정: export OPENAI_API_KEY=your-key"
        );
    }
    Ok(())
}

fn new_thread_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["docqa", "clean", "--format", "text"]).unwrap();
        match cli.command {
            Commands::Clean { format, selector, .. } => {
                assert_eq!(format, OutputFormat::Text);
                assert_eq!(selector, DEFAULT_CONTENT_SELECTOR);
            }
            _ => panic!("expected clean"),
        }

        let cli = Cli::try_parse_from(["docqa", "ask", "What is a kernel?", "-t", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Ask { ref question, thread: Some(ref t) } if question == "What is a kernel?" && t == "abc"
        ));

        let cli = Cli::try_parse_from(["docqa", "threads", "delete", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Threads { action: ThreadAction::Delete { ref id } } if id == "abc"
        ));

        assert!(Cli::try_parse_from(["docqa", "serve", "--addr", "not-an-addr"]).is_err());
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_truncate_unicode() {
        let korean = "안녕하세요 세계";
        let truncated = truncate_text(korean, 5);
        assert_eq!(truncated, "안녕하세요...");
    }
}
