//! Outbound HTTP: one shared client with permissive TLS, rotating
//! User-Agent, a global concurrency cap, and class-aware retries.
//!
//! Target sites are hostile in mundane ways: expired certificates, GBK
//! bodies mislabeled as UTF-8, Cloudflare 52x, and per-IP rate limits. The
//! retry policy in [`HttpClient::fetch`] covers exactly those classes;
//! anything else fails fast.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng as _;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, REFERER, RETRY_AFTER, USER_AGENT};
use tokio::sync::Semaphore;
use url::Url;

use crate::error::{Error, Result};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
];

const ACCEPT_VALUE: &str = "text/html,*/*;q=0.8";
const ACCEPT_LANGUAGE_VALUE: &str = "zh-CN,zh;q=0.9,en;q=0.8";
const MAX_REDIRECTS: usize = 5;
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const SERVER_ERROR_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// POST body shapes supported by rule templates.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
    Raw(String),
}

/// One logical page request.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: Url,
    pub body: Option<RequestBody>,
    pub timeout: Duration,
    /// Rule-declared page encoding label; `utf-8` means "trust the page".
    pub encoding: Option<String>,
    pub referer: Option<String>,
}

impl PageRequest {
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            body: None,
            timeout,
            encoding: None,
            referer: None,
        }
    }
}

/// A successfully fetched, decoded page.
#[derive(Debug)]
pub struct FetchedPage {
    /// URL after redirects; selector output absolutizes against this.
    pub final_url: Url,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    Timeout,
    Connect,
    ServerError(u16),
    /// 429; carries the parsed `Retry-After` seconds when present.
    RateLimited(Option<u64>),
    Blocked(u16),
    ClientError(u16),
    SchemeOrTls,
}

impl FailureClass {
    fn retryable(self) -> bool {
        !matches!(self, Self::ClientError(_))
    }

    /// Classes that mean "the site is refusing us" once retries run out.
    fn is_blocking(self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Blocked(_) | Self::ServerError(520..=522)
        )
    }
}

pub struct HttpClient {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    ua_cursor: AtomicUsize,
}

impl HttpClient {
    pub fn new(max_concurrent: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            ua_cursor: AtomicUsize::new(0),
        })
    }

    fn next_user_agent(&self) -> &'static str {
        let idx = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[idx % USER_AGENTS.len()]
    }

    /// Fetch and decode a page, retrying per the failure-class policy.
    pub async fn fetch(&self, request: &PageRequest) -> Result<FetchedPage> {
        let mut url = request.url.clone();
        let mut timeout = request.timeout;
        let mut scheme_flipped = false;
        let mut last_status: Option<u16> = None;
        let mut last_class: Option<FailureClass> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| Error::internal("http permit semaphore closed"))?;
                self.attempt(&url, request, timeout).await
            };

            let class = match outcome {
                Ok(page) => return Ok(page),
                Err(class) => class,
            };
            last_class = Some(class);
            match class {
                FailureClass::ServerError(s)
                | FailureClass::Blocked(s)
                | FailureClass::ClientError(s) => last_status = Some(s),
                FailureClass::RateLimited(_) => last_status = Some(429),
                _ => {}
            }

            tracing::debug!(url = %url, attempt, ?class, "fetch attempt failed");

            match class {
                FailureClass::SchemeOrTls if !scheme_flipped => {
                    // Many rule files still say http:// for sites that
                    // moved to https (and vice versa with broken certs).
                    if flip_scheme(&mut url) {
                        scheme_flipped = true;
                        continue;
                    }
                }
                FailureClass::ClientError(_) => {
                    return Err(Error::Network {
                        url: request.url.to_string(),
                        last_status,
                        attempts: attempt,
                    });
                }
                _ => {}
            }

            if attempt == MAX_ATTEMPTS || !class.retryable() {
                break;
            }

            if class == FailureClass::Timeout {
                timeout = timeout.mul_f64(1.5);
            }
            tokio::time::sleep(self.retry_delay(class, attempt)).await;
        }

        if last_class.is_some_and(FailureClass::is_blocking) {
            return Err(Error::SourceBlocked {
                url: request.url.to_string(),
                status: last_status.unwrap_or(429),
            });
        }
        Err(Error::Network {
            url: request.url.to_string(),
            last_status,
            attempts: MAX_ATTEMPTS,
        })
    }

    async fn attempt(
        &self,
        url: &Url,
        request: &PageRequest,
        timeout: Duration,
    ) -> std::result::Result<FetchedPage, FailureClass> {
        let mut builder = match &request.body {
            None => self.client.get(url.clone()),
            Some(RequestBody::Form(fields)) => self.client.post(url.clone()).form(fields),
            Some(RequestBody::Json(value)) => self.client.post(url.clone()).json(value),
            Some(RequestBody::Raw(text)) => self
                .client
                .post(url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(text.clone()),
        };
        builder = builder
            .header(USER_AGENT, self.next_user_agent())
            .header(ACCEPT, ACCEPT_VALUE)
            .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGE_VALUE)
            .timeout(timeout);
        if let Some(referer) = &request.referer {
            builder = builder.header(REFERER, referer.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return Err(classify_request_error(&err)),
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            // Cloudflare origin errors sit in the 52x range.
            return Err(classify_status(status, retry_after));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return Err(classify_request_error(&err)),
        };

        let body = decode_body(&bytes, request.encoding.as_deref(), content_type.as_deref());
        Ok(FetchedPage { final_url, body })
    }

    fn retry_delay(&self, class: FailureClass, attempt: u32) -> Duration {
        if let FailureClass::RateLimited(Some(secs)) = class {
            return Duration::from_secs(secs.min(120));
        }
        let base = match class {
            FailureClass::ServerError(_) => SERVER_ERROR_BACKOFF_BASE,
            FailureClass::Connect => BACKOFF_BASE + Duration::from_millis(500),
            _ => BACKOFF_BASE,
        };
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.5);
        backoff_delay(base, attempt, jitter)
    }
}

/// `base × 2^(attempt-1) × (1 + jitter)`, jitter ∈ [0, 0.5).
pub fn backoff_delay(base: Duration, attempt: u32, jitter: f64) -> Duration {
    let factor = (1u64 << (attempt.saturating_sub(1)).min(6)) as f64;
    base.mul_f64(factor * (1.0 + jitter))
}

fn flip_scheme(url: &mut Url) -> bool {
    let flipped = match url.scheme() {
        "http" => "https",
        "https" => "http",
        _ => return false,
    };
    url.set_scheme(flipped).is_ok()
}

fn classify_status(status: StatusCode, retry_after: Option<u64>) -> FailureClass {
    let code = status.as_u16();
    match code {
        429 => FailureClass::RateLimited(retry_after),
        403 => FailureClass::Blocked(code),
        520..=522 => FailureClass::ServerError(code),
        _ if status.is_server_error() => FailureClass::ServerError(code),
        _ => FailureClass::ClientError(code),
    }
}

fn classify_request_error(err: &reqwest::Error) -> FailureClass {
    if err.is_timeout() {
        return FailureClass::Timeout;
    }
    let text = err.to_string().to_lowercase();
    if text.contains("certificate")
        || text.contains("handshake")
        || text.contains("tls")
        || text.contains("ssl")
        || text.contains("scheme")
        || text.contains("protocol")
    {
        return FailureClass::SchemeOrTls;
    }
    FailureClass::Connect
}

/// Decode a response body: rule-declared encoding first, then strict UTF-8,
/// then the Content-Type charset, then a `<meta charset>` sniff, then
/// lossy UTF-8.
pub fn decode_body(bytes: &[u8], declared: Option<&str>, content_type: Option<&str>) -> String {
    if let Some(label) = declared {
        if !label.eq_ignore_ascii_case("utf-8") && !label.eq_ignore_ascii_case("utf8") {
            if let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) {
                let (text, _, _) = encoding.decode(bytes);
                return text.into_owned();
            }
        }
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }

    let charset = content_type
        .and_then(charset_from_content_type)
        .or_else(|| sniff_meta_charset(bytes));
    if let Some(label) = charset {
        if let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) {
            let (text, _, _) = encoding.decode(bytes);
            return text.into_owned();
        }
    }

    String::from_utf8_lossy(bytes).into_owned()
}

fn charset_from_content_type(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let idx = lower.find("charset=")?;
    let value = lower[idx + "charset=".len()..]
        .trim_start_matches(['"', '\''])
        .split([';', '"', '\'', ' '])
        .next()?
        .trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Look for `<meta charset=...>` or the http-equiv variant in the head.
fn sniff_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(1024)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    let idx = head.find("charset=")?;
    let value: String = head[idx + "charset=".len()..]
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1, 0.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2, 0.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn backoff_jitter_stretches_delay() {
        let base = Duration::from_secs(1);
        let with_jitter = backoff_delay(base, 2, 0.49);
        assert!(with_jitter > Duration::from_secs(2));
        assert!(with_jitter < Duration::from_secs(3));
    }

    #[test]
    fn status_classes() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(30)),
            FailureClass::RateLimited(Some(30))
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, None),
            FailureClass::Blocked(403)
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, None),
            FailureClass::ClientError(404)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            FailureClass::ServerError(502)
        );
        assert_eq!(
            classify_status(StatusCode::from_u16(521).unwrap(), None),
            FailureClass::ServerError(521)
        );
        assert!(!FailureClass::ClientError(404).retryable());
        assert!(FailureClass::ServerError(500).retryable());
        // 403 and 429 retry through the full budget before being
        // surfaced as a block.
        assert!(FailureClass::Blocked(403).retryable());
        assert!(FailureClass::RateLimited(None).retryable());
        assert!(FailureClass::RateLimited(None).is_blocking());
        assert!(FailureClass::Blocked(403).is_blocking());
        assert!(FailureClass::ServerError(521).is_blocking());
        assert!(!FailureClass::ServerError(500).is_blocking());
    }

    #[test]
    fn flip_scheme_round_trips() {
        let mut url = Url::parse("http://example.com/x").unwrap();
        assert!(flip_scheme(&mut url));
        assert_eq!(url.scheme(), "https");
        assert!(flip_scheme(&mut url));
        assert_eq!(url.scheme(), "http");
    }

    #[test]
    fn decode_gbk_via_declared_encoding() {
        // "小说" in GBK.
        let gbk: &[u8] = &[0xD0, 0xA1, 0xCB, 0xB5];
        assert_eq!(decode_body(gbk, Some("gbk"), None), "小说");
    }

    #[test]
    fn decode_prefers_valid_utf8() {
        assert_eq!(decode_body("第一章".as_bytes(), None, None), "第一章");
    }

    #[test]
    fn decode_falls_back_to_content_type_charset() {
        let gbk: &[u8] = &[0xD0, 0xA1, 0xCB, 0xB5];
        assert_eq!(
            decode_body(gbk, None, Some("text/html; charset=GBK")),
            "小说"
        );
    }

    #[test]
    fn decode_sniffs_meta_charset() {
        let mut page = b"<html><head><meta charset=\"gbk\"></head><body>".to_vec();
        page.extend_from_slice(&[0xD0, 0xA1, 0xCB, 0xB5]);
        let decoded = decode_body(&page, None, None);
        assert!(decoded.contains("小说"));
    }

    #[test]
    fn charset_parsing() {
        assert_eq!(
            charset_from_content_type("text/html; charset=utf-8").as_deref(),
            Some("utf-8")
        );
        assert_eq!(
            charset_from_content_type("text/html; charset=\"gb2312\";").as_deref(),
            Some("gb2312")
        );
        assert_eq!(charset_from_content_type("text/html"), None);
    }
}
