//! One adapter binds a rule to the HTTP client, the selector engine, and
//! the cache, and exposes the four source operations: `search`, `detail`,
//! `toc`, `chapter`. Every operation is cache-consulted first and
//! cache-populated on success.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::{self, Cache};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::{HttpClient, PageRequest, RequestBody};
use crate::rules::{Rule, SearchMethod};
use crate::selector::{self, Expr};

/// A search hit from one source. `score` is filled in by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovelHit {
    #[serde(rename = "sourceId")]
    pub source_id: u32,
    #[serde(rename = "sourceName")]
    pub source_name: String,
    #[serde(rename = "url")]
    pub detail_url: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(rename = "latestChapter", skip_serializing_if = "Option::is_none")]
    pub latest_chapter: Option<String>,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovelDetail {
    #[serde(rename = "url")]
    pub detail_url: String,
    pub title: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Raw TOC entry as scraped; ordering and deduplication happen in the
/// normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
}

/// Per-source request counters, owned by the adapter.
#[derive(Debug, Default)]
pub struct SourceStats {
    requests: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatsSnapshot {
    pub requests: u64,
    pub failures: u64,
}

impl SourceStats {
    fn record(&self, failed: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

pub struct SourceAdapter {
    rule: Arc<Rule>,
    http: Arc<HttpClient>,
    cache: Arc<Cache>,
    config: Arc<Config>,
    ad_patterns: Vec<Regex>,
    stats: SourceStats,
}

impl SourceAdapter {
    pub fn new(
        rule: Arc<Rule>,
        http: Arc<HttpClient>,
        cache: Arc<Cache>,
        config: Arc<Config>,
    ) -> Self {
        let ad_patterns = rule
            .chapter
            .ad_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    tracing::warn!(rule = rule.id, pattern = %pattern, %err, "invalid ad pattern; skipped");
                    None
                }
            })
            .collect();
        Self {
            rule,
            http,
            cache,
            config,
            ad_patterns,
            stats: SourceStats::default(),
        }
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn id(&self) -> u32 {
        self.rule.id
    }

    pub fn name(&self) -> &str {
        &self.rule.name
    }

    pub fn stats(&self) -> SourceStatsSnapshot {
        self.stats.snapshot()
    }

    fn page_request(&self, url: Url, timeout_secs: u64) -> PageRequest {
        PageRequest {
            url,
            body: None,
            timeout: Duration::from_secs(timeout_secs),
            encoding: Some(self.rule.encoding.clone()),
            referer: Some(self.rule.base_url.to_string()),
        }
    }

    async fn fetch_tracked(&self, request: &PageRequest) -> Result<crate::http::FetchedPage> {
        let outcome = self.http.fetch(request).await;
        self.stats.record(outcome.is_err());
        outcome
    }

    /// Whether an unexpired search result for this keyword is already
    /// cached. Lets the aggregator report fully-cached responses.
    pub async fn has_cached_search(&self, keyword: &str) -> bool {
        let key = cache::search_key(self.rule.id, keyword);
        self.cache.get(&key).await.is_some()
    }

    /// Search this source. At most
    /// [`Config::max_hits_per_source`] hits are returned; scores are zero
    /// until the aggregator assigns them.
    pub async fn search(&self, keyword: &str) -> Result<Vec<NovelHit>> {
        let key = cache::search_key(self.rule.id, keyword);
        let bytes = self
            .cache
            .get_or_fetch(&key, cache::SEARCH_TTL, 0, || async {
                let hits = self.search_uncached(keyword).await?;
                serde_json::to_vec(&hits)
                    .map_err(|err| Error::internal(format!("encode search cache: {err}")))
            })
            .await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| Error::internal(format!("decode search cache: {err}")))
    }

    async fn search_uncached(&self, keyword: &str) -> Result<Vec<NovelHit>> {
        let encoded = percent_encode(keyword);
        let url_str = self.rule.search.url_template.replace("{keyword}", &encoded);
        let url = self.resolve_against_base(&url_str)?;

        let mut request = self.page_request(url, self.rule.search.timeout_secs);
        if self.rule.search.method == SearchMethod::Post {
            request.body = Some(build_post_body(
                self.rule.search.body_template.as_deref(),
                keyword,
            ));
        }

        let page = self.fetch_tracked(&request).await?;
        let document = Html::parse_document(&page.body);

        let list = selector::parse_css(&self.rule.search.list_selector)?;
        let title_expr = Expr::parse(&self.rule.search.title_selector)?;
        let link_expr = Expr::parse(&link_expression(
            self.rule
                .search
                .link_selector
                .as_deref()
                .unwrap_or(&self.rule.search.title_selector),
        ))?;
        let author_expr = match &self.rule.search.author_selector {
            Some(sel) => Some(Expr::parse(sel)?),
            None => None,
        };
        let latest_expr = match &self.rule.search.latest_selector {
            Some(sel) => Some(Expr::parse(sel)?),
            None => None,
        };

        let mut hits = Vec::new();
        for item in document.select(&list) {
            let Some(title) = title_expr.eval(item) else {
                continue;
            };
            let Some(link) = link_expr.eval(item) else {
                continue;
            };
            let Some(detail_url) = selector::absolutize(&page.final_url, &link) else {
                continue;
            };
            hits.push(NovelHit {
                source_id: self.rule.id,
                source_name: self.rule.name.clone(),
                detail_url: detail_url.to_string(),
                title,
                author: author_expr.as_ref().and_then(|e| e.eval(item)),
                latest_chapter: latest_expr.as_ref().and_then(|e| e.eval(item)),
                score: 0.0,
            });
            if hits.len() >= self.config.max_hits_per_source {
                break;
            }
        }

        tracing::debug!(source = self.rule.id, keyword, hits = hits.len(), "search parsed");
        Ok(hits)
    }

    pub async fn detail(&self, url: &str) -> Result<NovelDetail> {
        let key = cache::detail_key(url);
        let url = url.to_string();
        let bytes = self
            .cache
            .get_or_fetch(&key, cache::DETAIL_TTL, 0, || async {
                let detail = self.detail_uncached(&url).await?;
                serde_json::to_vec(&detail)
                    .map_err(|err| Error::internal(format!("encode detail cache: {err}")))
            })
            .await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| Error::internal(format!("decode detail cache: {err}")))
    }

    async fn detail_uncached(&self, url: &str) -> Result<NovelDetail> {
        let parsed = Url::parse(url).map_err(|_| Error::input(format!("invalid url: {url}")))?;
        let page = self
            .fetch_tracked(&self.page_request(parsed, self.rule.book.timeout_secs))
            .await?;
        let document = Html::parse_document(&page.body);

        let title = Expr::parse(&self.rule.book.title_selector)?
            .eval_document(&document)
            .ok_or_else(|| Error::parse("book page has no title"))?;
        let author = Expr::parse(&self.rule.book.author_selector)?
            .eval_document(&document)
            .unwrap_or_default();

        let optional = |raw: &Option<String>| -> Result<Option<String>> {
            match raw {
                Some(sel) => Ok(Expr::parse(sel)?.eval_document(&document)),
                None => Ok(None),
            }
        };
        let cover = match &self.rule.book.cover_selector {
            Some(sel) => Expr::parse(sel)?
                .eval_document(&document)
                .and_then(|v| selector::absolutize(&page.final_url, &v))
                .map(|u| u.to_string()),
            None => None,
        };

        Ok(NovelDetail {
            detail_url: url.to_string(),
            title,
            author,
            intro: optional(&self.rule.book.intro_selector)?,
            cover,
            category: optional(&self.rule.book.category_selector)?,
            status: optional(&self.rule.book.status_selector)?,
        })
    }

    /// Raw TOC in page order, pagination followed. Deduplication and
    /// ordering are the normalizer's job.
    pub async fn toc(&self, url: &str) -> Result<Vec<TocEntry>> {
        let key = cache::toc_key(url);
        let url = url.to_string();
        let bytes = self
            .cache
            .get_or_fetch(&key, cache::TOC_TTL, 0, || async {
                let entries = self.toc_uncached(&url).await?;
                serde_json::to_vec(&entries)
                    .map_err(|err| Error::internal(format!("encode toc cache: {err}")))
            })
            .await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| Error::internal(format!("decode toc cache: {err}")))
    }

    async fn toc_uncached(&self, url: &str) -> Result<Vec<TocEntry>> {
        let parsed = Url::parse(url).map_err(|_| Error::input(format!("invalid url: {url}")))?;
        let transform = match &self.rule.toc.url_transform {
            Some(t) => Some((
                Regex::new(&t.from)
                    .map_err(|err| Error::parse(format!("invalid url transform: {err}")))?,
                t.to.clone(),
            )),
            None => None,
        };

        let next_page_expr = match &self.rule.toc.next_page_selector {
            Some(sel) => Some(Expr::parse(&link_expression(sel))?),
            None => None,
        };
        // `text` / `href` take the item's own text or attribute; anything
        // else is a selector expression, compiled once for the whole TOC.
        let title_expr = if self.rule.toc.title_extractor.eq_ignore_ascii_case("text") {
            None
        } else {
            Some(Expr::parse(&self.rule.toc.title_extractor)?)
        };
        let url_expr = if self.rule.toc.url_extractor.eq_ignore_ascii_case("href") {
            None
        } else {
            Some(Expr::parse(&link_expression(&self.rule.toc.url_extractor))?)
        };

        let mut entries = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut current = parsed;

        for page_index in 0..self.config.max_toc_pages {
            if !visited.insert(current.to_string()) {
                break;
            }
            let page = self
                .fetch_tracked(&self.page_request(current.clone(), self.rule.toc.timeout_secs))
                .await?;
            let document = Html::parse_document(&page.body);

            let items = self.toc_items(&document)?;
            for item in &items {
                let Some(title) = toc_title(*item, title_expr.as_ref()) else {
                    continue;
                };
                let Some(raw_url) = toc_url(*item, url_expr.as_ref()) else {
                    continue;
                };
                let raw_url = match &transform {
                    Some((pattern, to)) => pattern.replace(&raw_url, to.as_str()).into_owned(),
                    None => raw_url,
                };
                let Some(absolute) = selector::absolutize(&page.final_url, &raw_url) else {
                    continue;
                };
                entries.push(TocEntry {
                    title,
                    url: absolute.to_string(),
                });
            }

            if !self.rule.toc.has_pages {
                break;
            }
            let Some(next) = next_page_expr
                .as_ref()
                .and_then(|expr| expr.eval_document(&document))
                .and_then(|link| selector::absolutize(&page.final_url, &link))
            else {
                break;
            };
            tracing::debug!(source = self.rule.id, page = page_index + 1, next = %next, "following toc pagination");
            current = next;
        }

        if entries.is_empty() {
            return Err(Error::not_found(format!(
                "source {} returned an empty toc",
                self.rule.id
            )));
        }
        Ok(entries)
    }

    /// Resolve the list selector's `|`-fallbacks: first alternative with
    /// matches wins.
    fn toc_items<'a>(&self, document: &'a Html) -> Result<Vec<ElementRef<'a>>> {
        for alternative in self.rule.toc.list_selector.split('|') {
            let alternative = alternative.trim();
            if alternative.is_empty() {
                continue;
            }
            let list = selector::parse_css(alternative)?;
            let items: Vec<ElementRef<'a>> = document.select(&list).collect();
            if !items.is_empty() {
                return Ok(items);
            }
        }
        Ok(Vec::new())
    }

    /// Fetch one chapter body as cleaned plain text.
    pub async fn chapter(&self, url: &str) -> Result<ChapterContent> {
        let key = cache::chapter_key(url);
        let url = url.to_string();
        let bytes = self
            .cache
            .get_or_fetch(&key, cache::CHAPTER_TTL, self.config.min_chapter_len, || async {
                let chapter = self.chapter_uncached(&url).await?;
                serde_json::to_vec(&chapter)
                    .map_err(|err| Error::internal(format!("encode chapter cache: {err}")))
            })
            .await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| Error::internal(format!("decode chapter cache: {err}")))
    }

    async fn chapter_uncached(&self, url: &str) -> Result<ChapterContent> {
        let parsed = Url::parse(url).map_err(|_| Error::input(format!("invalid url: {url}")))?;
        let page = self
            .fetch_tracked(&self.page_request(parsed, self.rule.chapter.timeout_secs))
            .await?;
        let document = Html::parse_document(&page.body);

        let container_sel = selector::parse_css(&self.rule.chapter.content_selector)?;
        let container = document
            .select(&container_sel)
            .next()
            .ok_or_else(|| Error::parse("chapter page has no content container"))?;

        let remove: Vec<Selector> = self
            .rule
            .chapter
            .remove_selectors
            .iter()
            .filter_map(|sel| selector::parse_css(sel).ok())
            .collect();

        let mut content = extract_paragraph_text(container, &remove);
        for pattern in &self.ad_patterns {
            content = pattern.replace_all(&content, "").into_owned();
        }
        let content = tidy_paragraphs(&content);

        if content.len() < self.config.min_chapter_len {
            return Err(Error::parse(format!(
                "chapter body too short ({} bytes)",
                content.len()
            )));
        }

        let title = match &self.rule.chapter.title_selector {
            Some(sel) => Expr::parse(sel)?.eval_document(&document),
            None => None,
        };

        Ok(ChapterContent { title, content })
    }

    fn resolve_against_base(&self, url: &str) -> Result<Url> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Url::parse(url).map_err(|_| Error::input(format!("invalid url: {url}")));
        }
        self.rule
            .base_url
            .join(url.trim_start_matches('/'))
            .map_err(|_| Error::input(format!("invalid url: {url}")))
    }
}

/// All adapters, keyed by source id. Built once at startup from the rule
/// set and shared read-only.
pub struct AdapterSet {
    adapters: Vec<Arc<SourceAdapter>>,
}

impl AdapterSet {
    pub fn new(
        rules: &crate::rules::RuleSet,
        http: Arc<HttpClient>,
        cache: Arc<Cache>,
        config: Arc<Config>,
    ) -> Self {
        let adapters = rules
            .all()
            .iter()
            .map(|rule| {
                Arc::new(SourceAdapter::new(
                    Arc::clone(rule),
                    Arc::clone(&http),
                    Arc::clone(&cache),
                    Arc::clone(&config),
                ))
            })
            .collect();
        Self { adapters }
    }

    pub fn get(&self, source_id: u32) -> Result<Arc<SourceAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.id() == source_id && a.rule().enabled)
            .cloned()
            .ok_or_else(|| Error::SourceUnknown(source_id.to_string()))
    }

    pub fn enabled(&self) -> Vec<Arc<SourceAdapter>> {
        self.adapters
            .iter()
            .filter(|a| a.rule().enabled)
            .cloned()
            .collect()
    }
}

fn toc_title(item: ElementRef<'_>, expr: Option<&Expr>) -> Option<String> {
    match expr {
        Some(expr) => expr.eval(item),
        None => {
            let text = selector::element_text(item);
            (!text.is_empty()).then_some(text)
        }
    }
}

fn toc_url(item: ElementRef<'_>, expr: Option<&Expr>) -> Option<String> {
    match expr {
        Some(expr) => expr.eval(item),
        None => {
            if let Some(href) = item.value().attr("href") {
                return Some(href.to_string());
            }
            // The list selector may match `li` items wrapping the link.
            let anchor = selector::parse_css("a[href]").ok()?;
            item.select(&anchor)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(str::to_string)
        }
    }
}

/// Make a selector expression extract a link: leave `@attr`, `text`, and
/// replace-suffixed forms alone, otherwise append `@href`.
fn link_expression(raw: &str) -> String {
    raw.split('|')
        .map(|alt| {
            let alt = alt.trim();
            if alt.eq_ignore_ascii_case("href") {
                "@href".to_string()
            } else if alt.contains('@') || alt.contains("##") || alt.eq_ignore_ascii_case("text") {
                alt.to_string()
            } else {
                format!("{alt}@href")
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// RFC 3986 unreserved-set percent encoding, used for the keyword
/// placeholder and for `filename*` response headers.
pub(crate) fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        let is_unreserved = matches!(
            b,
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~'
        );
        if is_unreserved {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{b:02X}"));
        }
    }
    out
}

/// POST body templates come in three legacy shapes: JSON, `{key: value}`,
/// and `key=value`. Anything else is sent as a raw urlencoded string.
fn build_post_body(template: Option<&str>, keyword: &str) -> RequestBody {
    let Some(template) = template else {
        return RequestBody::Form(vec![("keyword".to_string(), keyword.to_string())]);
    };
    let filled = template.replace("{keyword}", keyword);

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&filled) {
        if value.is_object() {
            return RequestBody::Json(value);
        }
    }
    if let Some(inner) = filled
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
    {
        if let Some((key, value)) = inner.split_once(':') {
            return RequestBody::Form(vec![(key.trim().to_string(), value.trim().to_string())]);
        }
    }
    if let Some((key, value)) = filled.split_once('=') {
        if !key.contains('&') && !value.contains('&') {
            return RequestBody::Form(vec![(key.trim().to_string(), value.trim().to_string())]);
        }
    }
    RequestBody::Raw(filled)
}

const BLOCK_TAGS: &[&str] = &["p", "div", "li", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "section"];
const SKIP_TAGS: &[&str] = &["script", "style", "ins", "iframe"];

/// Text of a container subtree with paragraph breaks preserved and the
/// given subtrees removed.
fn extract_paragraph_text(container: ElementRef<'_>, remove: &[Selector]) -> String {
    let mut out = String::new();
    for child in container.children() {
        walk_node(child, remove, &mut out);
    }
    out
}

fn walk_node(node: ego_tree::NodeRef<'_, scraper::Node>, remove: &[Selector], out: &mut String) {
    match node.value() {
        scraper::Node::Text(text) => out.push_str(text),
        scraper::Node::Element(element) => {
            let name = element.name();
            if SKIP_TAGS.contains(&name) {
                return;
            }
            if let Some(element_ref) = ElementRef::wrap(node) {
                if remove.iter().any(|sel| sel.matches(&element_ref)) {
                    return;
                }
            }
            if name == "br" {
                out.push('\n');
                return;
            }
            let block = BLOCK_TAGS.contains(&name);
            if block {
                out.push('\n');
            }
            for child in node.children() {
                walk_node(child, remove, out);
            }
            if block {
                out.push('\n');
            }
        }
        _ => {}
    }
}

/// Collapse the raw walk output into trimmed paragraphs separated by blank
/// lines.
fn tidy_paragraphs(raw: &str) -> String {
    raw.lines()
        .map(selector::normalize_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encoding_keeps_unreserved() {
        assert_eq!(percent_encode("abc-123"), "abc-123");
        assert_eq!(percent_encode("斗破"), "%E6%96%97%E7%A0%B4");
        assert_eq!(percent_encode("a b"), "a%20b");
    }

    #[test]
    fn link_expression_forms() {
        assert_eq!(link_expression("h3 a"), "h3 a@href");
        assert_eq!(link_expression("h3 a@href"), "h3 a@href");
        assert_eq!(link_expression("href"), "@href");
        assert_eq!(link_expression(".a | .b@data-url"), ".a@href | .b@data-url");
    }

    #[test]
    fn post_body_template_shapes() {
        match build_post_body(Some(r#"{"kw": "{keyword}", "page": 1}"#), "x") {
            RequestBody::Json(v) => assert_eq!(v["kw"], "x"),
            other => panic!("expected json body, got {other:?}"),
        }
        match build_post_body(Some("{searchkey: {keyword}}"), "斗破") {
            RequestBody::Form(fields) => {
                assert_eq!(fields, vec![("searchkey".to_string(), "斗破".to_string())]);
            }
            other => panic!("expected form body, got {other:?}"),
        }
        match build_post_body(Some("searchkey={keyword}"), "x") {
            RequestBody::Form(fields) => {
                assert_eq!(fields, vec![("searchkey".to_string(), "x".to_string())]);
            }
            other => panic!("expected form body, got {other:?}"),
        }
        match build_post_body(Some("a={keyword}&b=1"), "x") {
            RequestBody::Raw(raw) => assert_eq!(raw, "a=x&b=1"),
            other => panic!("expected raw body, got {other:?}"),
        }
    }

    #[test]
    fn paragraph_extraction_preserves_breaks_and_strips_removed() {
        let html = Html::parse_document(
            r#"<div id="content">
                <p>第一段。</p>
                <p>第二段。</p>
                <div class="ads">广告内容</div>
                line one<br>line two
            </div>"#,
        );
        let container_sel = selector::parse_css("#content").unwrap();
        let container = html.select(&container_sel).next().unwrap();
        let remove = vec![selector::parse_css(".ads").unwrap()];

        let text = tidy_paragraphs(&extract_paragraph_text(container, &remove));
        assert_eq!(text, "第一段。\n\n第二段。\n\nline one\n\nline two");
        assert!(!text.contains("广告"));
    }

    #[test]
    fn script_content_is_never_extracted() {
        let html = Html::parse_document(
            r#"<div id="c"><p>正文</p><script>var x = "junk";</script></div>"#,
        );
        let container = html
            .select(&selector::parse_css("#c").unwrap())
            .next()
            .unwrap();
        let text = tidy_paragraphs(&extract_paragraph_text(container, &[]));
        assert_eq!(text, "正文");
    }
}
