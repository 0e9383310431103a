//! 크롤러 모듈 - 문서 사이트 링크 수집 및 원본 HTML 저장
//!
//! 시작 페이지에서 출발해 사이트 내부의 `.html` 링크만 따라가며
//! 방문 집합으로 중복 방문을 막습니다.
//! 실패한 페이지는 로그만 남기고 건너뜁니다.

use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use url::Url;

/// 기본 User-Agent
const USER_AGENT: &str = concat!("docqa/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Configuration
// ============================================================================

/// 크롤링 설정
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// 시작 URL
    pub base_url: Url,
    /// 내부 링크로 인정할 URL 접두사
    pub site_prefix: Url,
    pub user_agent: String,
    pub timeout: Duration,
    /// 최대 수집 페이지 수 (None = 무제한)
    pub max_pages: Option<usize>,
}

impl CrawlConfig {
    /// 시작 URL로 설정 생성
    ///
    /// 사이트 접두사는 시작 URL의 마지막 경로 세그먼트를 뗀 디렉토리입니다.
    /// (`https://host/raccoon/index.html` -> `https://host/raccoon/`)
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("Invalid base URL")?;
        let mut site_prefix = base_url.join("./").context("Failed to derive site prefix")?;
        site_prefix.set_query(None);
        site_prefix.set_fragment(None);

        Ok(Self {
            base_url,
            site_prefix,
            user_agent: USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            max_pages: None,
        })
    }

    /// 사이트 접두사 지정
    pub fn with_site_prefix(mut self, prefix: &str) -> Result<Self> {
        self.site_prefix = Url::parse(prefix).context("Invalid site prefix")?;
        Ok(self)
    }

    /// 최대 페이지 수 지정
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }
}

// ============================================================================
// Reports
// ============================================================================

/// 다운로드 결과 요약
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub saved: Vec<PathBuf>,
    pub failed: Vec<String>,
}

// ============================================================================
// DocCrawler
// ============================================================================

/// 문서 사이트 크롤러
pub struct DocCrawler {
    client: reqwest::Client,
    config: CrawlConfig,
}

impl DocCrawler {
    /// 새 크롤러 생성
    pub fn new(config: CrawlConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()
            .context("HTTP 클라이언트 생성 실패")?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// 사이트 내부 링크 전체 수집
    ///
    /// LIFO 작업 목록 기반 깊이 우선 탐색입니다.
    /// 반환값은 정렬된 고유 URL 목록입니다.
    pub async fn crawl(&self) -> Result<Vec<Url>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut to_visit: Vec<Url> = vec![normalize_url(self.config.base_url.clone())];
        let mut all_links: BTreeSet<String> = BTreeSet::new();

        tracing::info!("Starting crawl from: {}", self.config.base_url);

        while let Some(current) = to_visit.pop() {
            if let Some(max) = self.config.max_pages {
                if all_links.len() >= max {
                    tracing::info!("Reached page limit ({}), stopping crawl", max);
                    break;
                }
            }

            if visited.contains(current.as_str()) {
                continue;
            }

            let html = match self.fetch(&current).await {
                Ok(html) => html,
                Err(e) => {
                    tracing::error!("Failed to fetch {}: {:#}", current, e);
                    continue;
                }
            };

            visited.insert(current.to_string());
            all_links.insert(current.to_string());

            for link in find_links(&html, &current) {
                if is_internal_link(&link, &self.config.site_prefix)
                    && !visited.contains(link.as_str())
                {
                    to_visit.push(link);
                }
            }

            tracing::debug!(
                "Crawled {} (found {}, queued {})",
                current,
                all_links.len(),
                to_visit.len()
            );
        }

        tracing::info!("Finished crawl from: {} ({} pages)", self.config.base_url, all_links.len());

        // BTreeSet 순서 = 정렬 순서
        let links = all_links
            .into_iter()
            .filter_map(|s| Url::parse(&s).ok())
            .collect();

        Ok(links)
    }

    /// 페이지 하나를 다운로드하여 저장
    ///
    /// 저장 경로는 사이트 접두사 기준 상대 경로를 유지합니다.
    pub async fn save_page(&self, url: &Url, output_dir: &Path) -> Result<PathBuf> {
        let html = self.fetch(url).await?;

        let relative = page_relative_path(url, &self.config.site_prefix);
        let filepath = output_dir.join(relative);

        if let Some(parent) = filepath.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        tokio::fs::write(&filepath, html)
            .await
            .with_context(|| format!("Could not save file {}", filepath.display()))?;

        tracing::info!("Saved {}", filepath.display());
        Ok(filepath)
    }

    /// 링크 목록 전체 다운로드 (실패는 기록 후 계속)
    pub async fn download_all(&self, links: &[Url], output_dir: &Path) -> DownloadReport {
        let mut report = DownloadReport::default();

        for (i, link) in links.iter().enumerate() {
            tracing::debug!("Downloading {}/{}: {}", i + 1, links.len(), link);

            match self.save_page(link, output_dir).await {
                Ok(path) => report.saved.push(path),
                Err(e) => {
                    tracing::error!("Could not save {}: {:#}", link, e);
                    report.failed.push(link.to_string());
                }
            }
        }

        report
    }

    /// HTTP GET (2xx 외 상태는 에러)
    async fn fetch(&self, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .context("HTTP 요청 실패")?
            .error_for_status()
            .context("HTTP 오류 응답")?;

        response.text().await.context("응답 본문 읽기 실패")
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 내부 문서 링크 여부
///
/// `.html`로 끝나고 사이트 접두사 아래에 있어야 합니다.
pub fn is_internal_link(url: &Url, site_prefix: &Url) -> bool {
    let url = normalize_url(url.clone());
    url.path().ends_with(".html") && url.as_str().starts_with(site_prefix.as_str())
}

/// 사이트 접두사 기준 상대 저장 경로
///
/// `/raccoon/a/b.html` + 접두사 `/raccoon/` -> `a/b.html`
pub fn page_relative_path(url: &Url, site_prefix: &Url) -> PathBuf {
    let path = url.path();
    let relative = path.strip_prefix(site_prefix.path()).unwrap_or(path);

    let mut out = PathBuf::new();
    for component in Path::new(relative.trim_start_matches('/')).components() {
        // 상위 디렉토리 탈출 방지
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }

    if out.as_os_str().is_empty() {
        out.push("index.html");
    }

    out
}

/// 쿼리/프래그먼트 제거
fn normalize_url(mut url: Url) -> Url {
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// 페이지의 모든 `<a href>`를 절대 URL로 변환
fn find_links(html: &str, page_url: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return vec![];
    };

    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| !href.trim().is_empty())
        .filter_map(|href| page_url.join(href.trim()).ok())
        .map(normalize_url)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Html as HtmlResponse;
    use axum::routing::get;
    use axum::Router;
    use tempfile::TempDir;

    const INDEX_PAGE: &str = r#"
        <html><body>
            <a href="a.html">A</a>
            <a href="sub/b.html#section">B</a>
            <a href="a.html?x=1">A again</a>
            <a href="missing.html">Missing</a>
            <a href="../outside.html">Outside</a>
            <a href="https://example.com/docs/other.html">External</a>
            <a href="style.css">Not a page</a>
            <a href="">Empty</a>
        </body></html>
    "#;

    const A_PAGE: &str = r#"
        <html><body>
            <a href="index.html">Home</a>
            <a href="sub/b.html">B</a>
        </body></html>
    "#;

    const B_PAGE: &str = r#"
        <html><body><a href="../a.html">A</a></body></html>
    "#;

    async fn spawn_site() -> String {
        let app = Router::new()
            .route("/docs/index.html", get(|| async { HtmlResponse(INDEX_PAGE) }))
            .route("/docs/a.html", get(|| async { HtmlResponse(A_PAGE) }))
            .route("/docs/sub/b.html", get(|| async { HtmlResponse(B_PAGE) }))
            .route("/outside.html", get(|| async { HtmlResponse("outside") }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        format!("http://{}/docs/index.html", addr)
    }

    #[test]
    fn test_site_prefix_derivation() {
        let config = CrawlConfig::new("https://hugary1995.github.io/raccoon/index.html").unwrap();
        assert_eq!(config.site_prefix.as_str(), "https://hugary1995.github.io/raccoon/");
    }

    #[test]
    fn test_is_internal_link() {
        let prefix = Url::parse("https://hugary1995.github.io/raccoon/").unwrap();
        let inside = Url::parse("https://hugary1995.github.io/raccoon/a/b.html").unwrap();
        let with_fragment = Url::parse("https://hugary1995.github.io/raccoon/a.html#top").unwrap();
        let not_html = Url::parse("https://hugary1995.github.io/raccoon/a.pdf").unwrap();
        let outside = Url::parse("https://hugary1995.github.io/other/a.html").unwrap();
        let other_host = Url::parse("https://example.com/raccoon/a.html").unwrap();

        assert!(is_internal_link(&inside, &prefix));
        assert!(is_internal_link(&with_fragment, &prefix));
        assert!(!is_internal_link(&not_html, &prefix));
        assert!(!is_internal_link(&outside, &prefix));
        assert!(!is_internal_link(&other_host, &prefix));
    }

    #[test]
    fn test_page_relative_path() {
        let prefix = Url::parse("https://hugary1995.github.io/raccoon/").unwrap();

        let url = Url::parse("https://hugary1995.github.io/raccoon/source/a/b.html").unwrap();
        assert_eq!(page_relative_path(&url, &prefix), PathBuf::from("source/a/b.html"));

        let url = Url::parse("https://hugary1995.github.io/raccoon/").unwrap();
        assert_eq!(page_relative_path(&url, &prefix), PathBuf::from("index.html"));

        // 접두사 밖 경로는 루트 기준
        let url = Url::parse("https://hugary1995.github.io/x/y.html").unwrap();
        assert_eq!(page_relative_path(&url, &prefix), PathBuf::from("x/y.html"));
    }

    #[test]
    fn test_find_links_resolves_relative() {
        let page = Url::parse("https://site.test/docs/sub/page.html").unwrap();
        let html = r#"<a href="../a.html#x">a</a><a href="c.html">c</a>"#;
        let links: Vec<String> = find_links(html, &page).into_iter().map(|u| u.to_string()).collect();
        assert_eq!(
            links,
            vec![
                "https://site.test/docs/a.html".to_string(),
                "https://site.test/docs/sub/c.html".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_crawl_collects_internal_pages() {
        let base = spawn_site().await;
        let crawler = DocCrawler::new(CrawlConfig::new(&base).unwrap()).unwrap();

        let links = crawler.crawl().await.unwrap();
        let paths: Vec<&str> = links.iter().map(|u| u.path()).collect();

        // missing.html(404), 외부/상위 경로, css는 제외
        assert_eq!(paths, vec!["/docs/a.html", "/docs/index.html", "/docs/sub/b.html"]);
    }

    #[tokio::test]
    async fn test_crawl_respects_max_pages() {
        let base = spawn_site().await;
        let config = CrawlConfig::new(&base).unwrap().with_max_pages(1);
        let crawler = DocCrawler::new(config).unwrap();

        let links = crawler.crawl().await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].path(), "/docs/index.html");
    }

    #[tokio::test]
    async fn test_download_all_keeps_structure() {
        let base = spawn_site().await;
        let crawler = DocCrawler::new(CrawlConfig::new(&base).unwrap()).unwrap();
        let out = TempDir::new().unwrap();

        let prefix = crawler.config().site_prefix.clone();
        let links = vec![
            prefix.join("sub/b.html").unwrap(),
            prefix.join("missing.html").unwrap(),
        ];

        let report = crawler.download_all(&links, out.path()).await;

        assert_eq!(report.saved.len(), 1);
        assert_eq!(report.failed.len(), 1);
        let saved = std::fs::read_to_string(out.path().join("sub/b.html")).unwrap();
        assert!(saved.contains("../a.html"));
    }
}
