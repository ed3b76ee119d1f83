//! Book-source rules: the canonical schema, normalization of legacy JSON
//! shapes, and directory loading.
//!
//! Rule files in the wild use several generations of field names (`url` vs
//! `baseUrl`, `search.list` vs `search.listSelector`, ...). Everything is
//! normalized into [`Rule`] at load time; downstream code never sees the
//! original shape. Rules that cannot be normalized are rejected with a
//! reason and skipped.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// HTTP method for the search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SearchMethod {
    #[default]
    Get,
    Post,
}

/// Regex-based rewrite applied to chapter URLs discovered in a TOC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlTransform {
    /// Pattern matched against the extracted URL.
    pub from: String,
    /// Replacement template; `$1`..`$n` reference capture groups.
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct SearchRule {
    /// Absolute or site-relative URL containing the `{keyword}` placeholder.
    pub url_template: String,
    pub method: SearchMethod,
    /// POST body template, also carrying `{keyword}`.
    pub body_template: Option<String>,
    pub list_selector: String,
    pub title_selector: String,
    pub author_selector: Option<String>,
    /// Selector for the element carrying the detail link; when absent the
    /// title element's own `href` is used.
    pub link_selector: Option<String>,
    pub latest_selector: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct BookRule {
    pub title_selector: String,
    pub author_selector: String,
    pub intro_selector: Option<String>,
    pub cover_selector: Option<String>,
    pub category_selector: Option<String>,
    pub status_selector: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TocRule {
    /// Pipe-joined fallback list; alternatives are tried left to right.
    pub list_selector: String,
    /// Selector, or the literal `text` for the item's own text.
    pub title_extractor: String,
    /// Selector, or the literal `href` for the item's own attribute.
    pub url_extractor: String,
    pub has_pages: bool,
    pub next_page_selector: Option<String>,
    pub url_transform: Option<UrlTransform>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ChapterRule {
    pub title_selector: Option<String>,
    pub content_selector: String,
    /// Regexes removed globally from the rendered text.
    pub ad_patterns: Vec<String>,
    /// DOM subtrees stripped before text extraction.
    pub remove_selectors: Vec<String>,
    pub timeout_secs: u64,
}

/// One book source, immutable once loaded and shared as `Arc<Rule>`.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: u32,
    pub name: String,
    pub base_url: Url,
    pub enabled: bool,
    /// Page encoding label (`utf-8`, `gbk`, ...); decoded via encoding_rs.
    pub encoding: String,
    pub search: SearchRule,
    pub book: BookRule,
    pub toc: TocRule,
    pub chapter: ChapterRule,
}

const DEFAULT_SEARCH_TIMEOUT: u64 = 8;
const DEFAULT_BOOK_TIMEOUT: u64 = 8;
const DEFAULT_TOC_TIMEOUT: u64 = 10;
const DEFAULT_CHAPTER_TIMEOUT: u64 = 8;

// Raw (legacy-tolerant) shapes. Field aliases cover the known generations
// of rule files; anything else fails deserialization and the rule is
// rejected.

#[derive(Debug, Deserialize)]
struct RawRule {
    id: i64,
    name: Option<String>,
    #[serde(alias = "baseUrl", alias = "base_url")]
    url: Option<String>,
    enabled: Option<bool>,
    #[serde(alias = "charset")]
    encoding: Option<String>,
    search: Option<RawSearch>,
    book: Option<RawBook>,
    toc: Option<RawToc>,
    chapter: Option<RawChapter>,
}

#[derive(Debug, Deserialize)]
struct RawSearch {
    #[serde(alias = "urlTemplate")]
    url: Option<String>,
    method: Option<String>,
    #[serde(alias = "bodyTemplate")]
    data: Option<String>,
    #[serde(alias = "listSelector", alias = "result")]
    list: Option<String>,
    #[serde(alias = "titleSelector", alias = "title")]
    name: Option<String>,
    #[serde(alias = "authorSelector")]
    author: Option<String>,
    #[serde(alias = "linkSelector")]
    link: Option<String>,
    #[serde(alias = "latestSelector", alias = "latestChapter")]
    latest: Option<String>,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(alias = "titleSelector", alias = "title")]
    name: Option<String>,
    #[serde(alias = "authorSelector")]
    author: Option<String>,
    #[serde(alias = "introSelector", alias = "description")]
    intro: Option<String>,
    #[serde(alias = "coverSelector")]
    cover: Option<String>,
    #[serde(alias = "categorySelector")]
    category: Option<String>,
    #[serde(alias = "statusSelector")]
    status: Option<String>,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawToc {
    #[serde(alias = "listSelector")]
    list: Option<String>,
    #[serde(alias = "titleExtractor")]
    title: Option<String>,
    #[serde(alias = "urlExtractor")]
    url: Option<String>,
    #[serde(alias = "hasPages")]
    has_pages: Option<bool>,
    #[serde(alias = "nextPageSelector", alias = "page_selector")]
    next_page: Option<String>,
    #[serde(alias = "urlTransform")]
    url_transform: Option<UrlTransform>,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawChapter {
    #[serde(alias = "titleSelector")]
    title: Option<String>,
    #[serde(alias = "contentSelector")]
    content: Option<String>,
    #[serde(alias = "adPatterns", alias = "filters", default)]
    ad_patterns: Vec<String>,
    #[serde(alias = "removeSelectors", default)]
    remove_selectors: Vec<String>,
    timeout: Option<u64>,
}

/// Backward compatibility: old templates used printf-style `%s` where newer
/// ones carry `{keyword}`.
fn rewrite_keyword_placeholder(template: &str) -> String {
    template.replace("%s", "{keyword}")
}

fn non_empty(value: Option<String>, what: &str) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::parse(format!("rule is missing {what}"))),
    }
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Rule {
    /// Normalize a loosely typed rule value into the canonical schema.
    pub fn normalize(value: serde_json::Value) -> Result<Self> {
        let raw: RawRule = serde_json::from_value(value)
            .map_err(|err| Error::parse(format!("rule does not deserialize: {err}")))?;

        if raw.id <= 0 {
            return Err(Error::parse(format!("rule id must be positive: {}", raw.id)));
        }
        let id = raw.id as u32;

        let base_url = non_empty(raw.url, "a base url")?;
        let base_url = Url::parse(&base_url)
            .map_err(|err| Error::parse(format!("rule {id} base url is not absolute: {err}")))?;
        if base_url.host_str().is_none() {
            return Err(Error::parse(format!("rule {id} base url has no host")));
        }

        let search = raw
            .search
            .ok_or_else(|| Error::parse(format!("rule {id} has no search section")))?;
        let book = raw
            .book
            .ok_or_else(|| Error::parse(format!("rule {id} has no book section")))?;
        let toc = raw
            .toc
            .ok_or_else(|| Error::parse(format!("rule {id} has no toc section")))?;
        let chapter = raw
            .chapter
            .ok_or_else(|| Error::parse(format!("rule {id} has no chapter section")))?;

        let url_template = rewrite_keyword_placeholder(&non_empty(search.url, "a search url")?);
        let body_template = optional(search.data).map(|t| rewrite_keyword_placeholder(&t));
        // The keyword slots into the URL for GET sources and may live only
        // in the body for POST sources.
        if !url_template.contains("{keyword}")
            && !body_template
                .as_deref()
                .is_some_and(|t| t.contains("{keyword}"))
        {
            return Err(Error::parse(format!(
                "rule {id} search has no {{keyword}} placeholder"
            )));
        }
        let method = match search.method.as_deref().map(str::trim) {
            None | Some("") => SearchMethod::Get,
            Some(m) if m.eq_ignore_ascii_case("get") => SearchMethod::Get,
            Some(m) if m.eq_ignore_ascii_case("post") => SearchMethod::Post,
            Some(other) => {
                return Err(Error::parse(format!(
                    "rule {id} has unsupported search method: {other}"
                )));
            }
        };

        let search = SearchRule {
            url_template,
            method,
            body_template,
            list_selector: non_empty(search.list, "a search list selector")?,
            title_selector: non_empty(search.name, "a search title selector")?,
            author_selector: optional(search.author),
            link_selector: optional(search.link),
            latest_selector: optional(search.latest),
            timeout_secs: search.timeout.unwrap_or(DEFAULT_SEARCH_TIMEOUT),
        };

        let book = BookRule {
            title_selector: non_empty(book.name, "a book title selector")?,
            author_selector: non_empty(book.author, "a book author selector")?,
            intro_selector: optional(book.intro),
            cover_selector: optional(book.cover),
            category_selector: optional(book.category),
            status_selector: optional(book.status),
            timeout_secs: book.timeout.unwrap_or(DEFAULT_BOOK_TIMEOUT),
        };

        let toc = TocRule {
            list_selector: non_empty(toc.list, "a toc list selector")?,
            title_extractor: optional(toc.title).unwrap_or_else(|| "text".to_string()),
            url_extractor: optional(toc.url).unwrap_or_else(|| "href".to_string()),
            has_pages: toc.has_pages.unwrap_or(false),
            next_page_selector: optional(toc.next_page),
            url_transform: toc.url_transform,
            timeout_secs: toc.timeout.unwrap_or(DEFAULT_TOC_TIMEOUT),
        };

        let chapter = ChapterRule {
            title_selector: optional(chapter.title),
            content_selector: non_empty(chapter.content, "a chapter content selector")?,
            ad_patterns: chapter
                .ad_patterns
                .into_iter()
                .filter(|p| !p.trim().is_empty())
                .collect(),
            remove_selectors: chapter
                .remove_selectors
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .collect(),
            timeout_secs: chapter.timeout.unwrap_or(DEFAULT_CHAPTER_TIMEOUT),
        };

        Ok(Rule {
            id,
            name: raw
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("source-{id}")),
            base_url,
            enabled: raw.enabled.unwrap_or(true),
            encoding: raw
                .encoding
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "utf-8".to_string()),
            search,
            book,
            toc,
            chapter,
        })
    }
}

/// Loaded rule set, shared read-only.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut rules: Vec<Arc<Rule>> = rules.into_iter().map(Arc::new).collect();
        rules.sort_by_key(|r| r.id);
        Self { rules }
    }

    /// Load every rule file in a directory. File names containing
    /// `template` or `unavailable` are ignored; a file may hold one rule
    /// object or an array of them. Bad rules are logged and skipped.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut rules = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(dir = %dir.display(), "rules directory does not exist");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read rules dir: {}", dir.display()));
            }
        };

        for entry in entries {
            let entry = entry.with_context(|| format!("iterate rules dir: {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_lowercase();
            if file_name.contains("template") || file_name.contains("unavailable") {
                continue;
            }

            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("read rule file: {}", path.display()))?;
            let value: serde_json::Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(file = %path.display(), %err, "rule file is not valid json; skipped");
                    continue;
                }
            };

            let values = match value {
                serde_json::Value::Array(items) => items,
                other => vec![other],
            };
            for value in values {
                match Rule::normalize(value) {
                    Ok(rule) => {
                        tracing::info!(id = rule.id, name = %rule.name, enabled = rule.enabled, "loaded rule");
                        rules.push(rule);
                    }
                    Err(err) => {
                        tracing::warn!(file = %path.display(), %err, "rule rejected");
                    }
                }
            }
        }

        tracing::info!(count = rules.len(), "rule set loaded");
        Ok(Self::new(rules))
    }

    pub fn get(&self, id: u32) -> Result<Arc<Rule>> {
        self.rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::SourceUnknown(id.to_string()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn all(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_rule_json() -> serde_json::Value {
        json!({
            "id": 3,
            "name": "测试书源",
            "url": "https://www.example.com",
            "search": {
                "url": "https://www.example.com/search?q={keyword}",
                "list": ".result-list li",
                "name": "h3 a",
                "author": ".author"
            },
            "book": {
                "name": "h1",
                "author": ".info .author"
            },
            "toc": {
                "list": "#chapters li a"
            },
            "chapter": {
                "content": "#content"
            }
        })
    }

    #[test]
    fn normalizes_minimal_rule() {
        let rule = Rule::normalize(minimal_rule_json()).unwrap();
        assert_eq!(rule.id, 3);
        assert_eq!(rule.name, "测试书源");
        assert!(rule.enabled);
        assert_eq!(rule.encoding, "utf-8");
        assert_eq!(rule.toc.title_extractor, "text");
        assert_eq!(rule.toc.url_extractor, "href");
        assert_eq!(rule.search.timeout_secs, 8);
        assert_eq!(rule.toc.timeout_secs, 10);
    }

    #[test]
    fn accepts_legacy_field_names() {
        let rule = Rule::normalize(json!({
            "id": 7,
            "baseUrl": "https://old.example.net",
            "search": {
                "urlTemplate": "/so.php?kw=%s",
                "method": "POST",
                "bodyTemplate": "searchkey=%s",
                "listSelector": "table tr",
                "titleSelector": "td.odd a",
                "authorSelector": "td:nth-child(3)"
            },
            "book": {
                "titleSelector": "meta[property=\"og:novel:book_name\"]",
                "authorSelector": "meta[property=\"og:novel:author\"]"
            },
            "toc": {
                "listSelector": "#list dd a | .chapter-list a",
                "hasPages": true,
                "nextPageSelector": ".page a.next"
            },
            "chapter": {
                "contentSelector": "#chaptercontent",
                "adPatterns": ["请记住本站.*?最新网址"]
            }
        }))
        .unwrap();

        assert_eq!(rule.search.method, SearchMethod::Post);
        assert_eq!(rule.search.url_template, "/so.php?kw={keyword}");
        assert_eq!(rule.search.body_template.as_deref(), Some("searchkey={keyword}"));
        assert!(rule.toc.has_pages);
        assert_eq!(rule.chapter.ad_patterns.len(), 1);
    }

    #[test]
    fn post_rule_may_carry_keyword_only_in_body() {
        let mut value = minimal_rule_json();
        value["search"]["url"] = json!("https://www.example.com/modules/article/search.php");
        value["search"]["method"] = json!("POST");
        value["search"]["data"] = json!("searchkey=%s");
        let rule = Rule::normalize(value).unwrap();
        assert_eq!(rule.search.body_template.as_deref(), Some("searchkey={keyword}"));
    }

    #[test]
    fn rejects_rule_without_keyword_placeholder() {
        let mut value = minimal_rule_json();
        value["search"]["url"] = json!("https://www.example.com/search");
        let err = Rule::normalize(value).unwrap_err();
        assert!(err.to_string().contains("{keyword}"));
    }

    #[test]
    fn rejects_non_positive_id() {
        let mut value = minimal_rule_json();
        value["id"] = json!(0);
        assert!(Rule::normalize(value).is_err());
    }

    #[test]
    fn rejects_relative_base_url() {
        let mut value = minimal_rule_json();
        value["url"] = json!("/not/absolute");
        assert!(Rule::normalize(value).is_err());
    }

    #[test]
    fn rule_set_lookup() {
        let rule = Rule::normalize(minimal_rule_json()).unwrap();
        let set = RuleSet::new(vec![rule]);
        assert!(set.get(3).is_ok());
        assert!(matches!(set.get(99), Err(Error::SourceUnknown(_))));
        assert_eq!(set.enabled_count(), 1);
    }
}
