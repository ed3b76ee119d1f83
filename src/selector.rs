//! Selector expressions evaluated against parsed HTML.
//!
//! Grammar, in evaluation order:
//!
//! - a plain CSS selector matches nodes; the first match's text is the value
//! - a trailing `@attr` extracts that attribute instead of text
//! - the literal `text` (or a bare `@attr`) applies to the context element
//!   itself
//! - `meta[name="X"]` and other `meta` selectors implicitly read `content`
//! - alternatives joined with `|` are tried left to right, first non-empty
//!   wins
//! - a trailing `##pattern##replacement` applies a regex replace to the
//!   extracted string
//!
//! Extracted text is trimmed with whitespace runs collapsed. Relative URLs
//! coming out of `href`/`src` attributes are absolutized by the caller via
//! [`absolutize`].

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{Error, Result};

/// Parse a CSS selector without panicking on malformed input.
pub fn parse_css(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| Error::parse(format!("invalid selector {css:?}: {e}")))
}

#[derive(Debug, Clone)]
struct Replace {
    pattern: Regex,
    replacement: String,
}

#[derive(Debug, Clone)]
struct Alternative {
    /// None means the context element itself.
    css: Option<Selector>,
    /// None means text content.
    attr: Option<String>,
    replace: Option<Replace>,
}

/// A compiled selector expression.
#[derive(Debug, Clone)]
pub struct Expr {
    alternatives: Vec<Alternative>,
}

impl Expr {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::parse("empty selector expression"));
        }

        let mut alternatives = Vec::new();
        for part in raw.split('|') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            alternatives.push(Self::parse_alternative(part)?);
        }
        if alternatives.is_empty() {
            return Err(Error::parse(format!("selector has no alternatives: {raw:?}")));
        }
        Ok(Self { alternatives })
    }

    fn parse_alternative(part: &str) -> Result<Alternative> {
        // Peel a trailing ##pattern##replacement.
        let (selector_part, replace) = match part.find("##") {
            Some(idx) => {
                let tail = &part[idx + 2..];
                let (pattern, replacement) = match tail.find("##") {
                    Some(mid) => (&tail[..mid], &tail[mid + 2..]),
                    None => (tail, ""),
                };
                let pattern = Regex::new(pattern)
                    .map_err(|e| Error::parse(format!("invalid replace pattern in {part:?}: {e}")))?;
                (
                    part[..idx].trim(),
                    Some(Replace {
                        pattern,
                        replacement: replacement.to_string(),
                    }),
                )
            }
            None => (part, None),
        };

        if selector_part.eq_ignore_ascii_case("text") {
            return Ok(Alternative {
                css: None,
                attr: None,
                replace,
            });
        }
        if let Some(attr) = selector_part.strip_prefix('@') {
            return Ok(Alternative {
                css: None,
                attr: Some(attr.to_string()),
                replace,
            });
        }

        // `div.title a@href` → css + attribute extraction. The attribute
        // name after the last `@` must look like one, so attribute-value
        // selectors such as a[href*="@"] are left intact.
        let (css_str, attr) = match selector_part.rsplit_once('@') {
            Some((css, attr))
                if !attr.is_empty()
                    && attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
            {
                (css.trim(), Some(attr.to_string()))
            }
            _ => (selector_part, None),
        };

        // meta tags keep their value in `content`.
        let attr = attr.or_else(|| {
            css_str
                .trim_start()
                .starts_with("meta")
                .then(|| "content".to_string())
        });

        Ok(Alternative {
            css: Some(parse_css(css_str)?),
            attr,
            replace,
        })
    }

    /// Evaluate against a context element; first non-empty alternative wins.
    pub fn eval(&self, element: ElementRef<'_>) -> Option<String> {
        for alt in &self.alternatives {
            let target = match &alt.css {
                Some(selector) => element.select(selector).next(),
                None => Some(element),
            };
            let Some(target) = target else { continue };

            let raw = match &alt.attr {
                Some(attr) => target.value().attr(attr).map(str::to_string),
                None => Some(element_text(target)),
            };
            let Some(raw) = raw else { continue };

            let value = match &alt.replace {
                Some(replace) => replace
                    .pattern
                    .replace_all(&raw, replace.replacement.as_str())
                    .into_owned(),
                None => raw,
            };
            let value = normalize_whitespace(&value);
            if !value.is_empty() {
                return Some(value);
            }
        }
        None
    }

    /// Evaluate against a whole document.
    pub fn eval_document(&self, document: &Html) -> Option<String> {
        self.eval(document.root_element())
    }
}

/// Text content with whitespace runs collapsed to single spaces.
pub fn element_text(element: ElementRef<'_>) -> String {
    normalize_whitespace(&element.text().collect::<String>())
}

pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Resolve a possibly-relative link against the document base.
pub fn absolutize(base: &Url, link: &str) -> Option<Url> {
    let link = link.trim();
    if link.is_empty() || link.starts_with("javascript:") || link.starts_with('#') {
        return None;
    }
    base.join(link).ok()
}
