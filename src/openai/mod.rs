//! OpenAI 호환 HTTP 클라이언트 - 임베딩/채팅 공용
//!
//! 모든 요청은 Rate Limiter를 거치고, 429/5xx 응답은 지수 백오프로
//! 재시도합니다. 성공 응답은 그대로 돌려주므로 스트리밍 응답도
//! 같은 경로를 씁니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;

/// Rate Limiter 설정 (분당 요청 수)
const RATE_LIMIT_RPM: u32 = 500;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// 호출 간 최소 딜레이
const MIN_DELAY_MS: u64 = 50;
/// 429/5xx 에러 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 1000;

// ============================================================================
// Rate Limiter
// ============================================================================

/// Rate Limiter with minimum delay between requests
#[derive(Debug)]
struct RateLimiter {
    requests: Vec<Instant>,
    max_requests: u32,
    window: Duration,
    min_delay: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    fn new(max_requests: u32, window: Duration, min_delay: Duration) -> Self {
        Self {
            requests: Vec::new(),
            max_requests,
            window,
            min_delay,
            last_request: None,
        }
    }

    /// 요청 가능 여부 확인 및 대기
    async fn acquire(&mut self) {
        // 1. 최소 딜레이 (버스트 방지)
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }

        let now = Instant::now();

        // 2. 윈도우 밖의 오래된 요청 제거
        self.requests.retain(|&t| now.duration_since(t) < self.window);

        // 3. 한도 초과 시 가장 오래된 요청이 빠질 때까지 대기
        if self.requests.len() >= self.max_requests as usize {
            if let Some(&oldest) = self.requests.first() {
                let wait_time = self.window.saturating_sub(now.duration_since(oldest));
                if !wait_time.is_zero() {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                    tokio::time::sleep(wait_time).await;
                }
                let now = Instant::now();
                self.requests.retain(|&t| now.duration_since(t) < self.window);
            }
        }

        // 4. 현재 요청 기록
        let now = Instant::now();
        self.requests.push(now);
        self.last_request = Some(now);
    }
}

// ============================================================================
// Error Body
// ============================================================================

/// OpenAI 에러 응답
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// 에러 본문에서 메시지 추출
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => match parsed.error.kind {
            Some(kind) => format!("OpenAI API error ({}, {}): {}", status, kind, parsed.error.message),
            None => format!("OpenAI API error ({}): {}", status, parsed.error.message),
        },
        Err(_) => format!("OpenAI API error ({}): {}", status, body),
    }
}

/// 재시도 대상 상태 코드 (429, 5xx)
fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt))
}

// ============================================================================
// OpenAiClient
// ============================================================================

/// OpenAI 호환 API 클라이언트
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl OpenAiClient {
    /// 새 클라이언트 생성
    ///
    /// # Arguments
    /// * `base_url` - 예: `https://api.openai.com/v1`
    /// * `api_key` - Bearer 토큰
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
                RATE_LIMIT_RPM,
                RATE_LIMIT_WINDOW,
                Duration::from_millis(MIN_DELAY_MS),
            ))),
        })
    }

    /// JSON POST (재시도 포함), 성공 응답 반환
    pub async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=MAX_RETRIES {
            {
                let mut limiter = self.rate_limiter.lock().await;
                limiter.acquire().await;
            }

            let response = match self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Failed to send request to {}: {}", path, e));
                    if attempt < MAX_RETRIES {
                        let wait = backoff(attempt);
                        tracing::warn!(
                            "Request failed, retrying in {:?} (attempt {}/{})",
                            wait,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let text = response.text().await.unwrap_or_default();

            if is_retryable(status) {
                last_error = Some(anyhow::anyhow!(error_message(status, &text)));
                if attempt < MAX_RETRIES {
                    let wait = backoff(attempt);
                    tracing::warn!(
                        "{} from {}, backing off {:?} (attempt {}/{})",
                        status,
                        path,
                        wait,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
            } else {
                anyhow::bail!(error_message(status, &text));
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Request to {} failed after {} retries", path, MAX_RETRIES)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_error_message_parses_openai_body() {
        let body = r#"{"error":{"message":"Invalid key","type":"invalid_request_error"}}"#;
        let msg = error_message(reqwest::StatusCode::UNAUTHORIZED, body);
        assert!(msg.contains("Invalid key"));
        assert!(msg.contains("invalid_request_error"));

        let msg = error_message(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert!(msg.contains("upstream down"));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable(reqwest::StatusCode::BAD_REQUEST));
        assert!(!is_retryable(reqwest::StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_rate_limiter_min_delay() {
        let mut limiter = RateLimiter::new(100, Duration::from_secs(60), Duration::from_millis(30));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_post_json_retries_on_429() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        async fn flaky() -> Result<Json<serde_json::Value>, StatusCode> {
            if CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StatusCode::TOO_MANY_REQUESTS)
            } else {
                Ok(Json(serde_json::json!({ "ok": true })))
            }
        }

        let app = Router::new().route("/v1/echo", post(flaky));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let client = OpenAiClient::new(&base, "test-key".to_string()).unwrap();
        let response = client
            .post_json("/echo", &serde_json::json!({}))
            .await
            .unwrap();
        let body: serde_json::Value = response.json().await.unwrap();

        assert_eq!(body["ok"], true);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_post_json_fails_fast_on_400() {
        async fn bad() -> (StatusCode, &'static str) {
            (
                StatusCode::BAD_REQUEST,
                r#"{"error":{"message":"bad input","type":"invalid_request_error"}}"#,
            )
        }

        let app = Router::new().route("/v1/bad", post(bad));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let client = OpenAiClient::new(&base, "test-key".to_string()).unwrap();
        let err = client
            .post_json("/bad", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad input"));
    }
}
