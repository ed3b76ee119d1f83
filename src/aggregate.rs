//! Search aggregation: fan a keyword out to every enabled source, merge,
//! deduplicate, and rank.
//!
//! Each source runs as its own task with its own timeout under a combined
//! deadline; a slow or broken source contributes a failure record, never an
//! aborted aggregate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::adapter::{NovelHit, SourceAdapter};

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    #[serde(rename = "sourceId")]
    pub source_id: u32,
    #[serde(rename = "sourceName")]
    pub source_name: String,
    pub error: String,
}

#[derive(Debug)]
pub struct SearchOutcome {
    /// Ranked hits, already truncated to the caller's limit.
    pub hits: Vec<NovelHit>,
    pub failures: Vec<SourceFailure>,
    /// True when every queried source answered from cache.
    pub cached: bool,
}

pub struct Aggregator {
    adapters: Vec<Arc<SourceAdapter>>,
    per_source_timeout: Duration,
    deadline: Duration,
}

impl Aggregator {
    pub fn new(
        adapters: Vec<Arc<SourceAdapter>>,
        per_source_timeout: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            adapters,
            per_source_timeout,
            deadline,
        }
    }

    pub async fn search_all(&self, keyword: &str, max_results: usize) -> SearchOutcome {
        let tokens = tokenize(keyword);

        let mut cached = !self.adapters.is_empty();
        for adapter in &self.adapters {
            if !adapter.has_cached_search(keyword).await {
                cached = false;
                break;
            }
        }

        let per_source_timeout = self.per_source_timeout.min(self.deadline);
        let mut tasks = JoinSet::new();
        for adapter in &self.adapters {
            let adapter = Arc::clone(adapter);
            let keyword = keyword.to_string();
            tasks.spawn(async move {
                let outcome =
                    tokio::time::timeout(per_source_timeout, adapter.search(&keyword)).await;
                let result = match outcome {
                    Ok(result) => result.map_err(|err| err.to_string()),
                    Err(_) => Err(format!(
                        "search timed out after {}ms",
                        per_source_timeout.as_millis()
                    )),
                };
                (adapter.id(), adapter.name().to_string(), result)
            });
        }

        let mut merged: HashMap<(String, String), NovelHit> = HashMap::new();
        let mut failures = Vec::new();
        let overall_deadline = tokio::time::Instant::now() + self.deadline;

        loop {
            let joined = tokio::time::timeout_at(overall_deadline, tasks.join_next()).await;
            match joined {
                Ok(Some(Ok((source_id, source_name, Ok(hits))))) => {
                    for mut hit in hits {
                        hit.score = score_hit(&hit, &tokens);
                        merge_hit(&mut merged, hit);
                    }
                    tracing::debug!(source = source_id, name = %source_name, "source search merged");
                }
                Ok(Some(Ok((source_id, source_name, Err(error))))) => {
                    tracing::warn!(source = source_id, name = %source_name, %error, "source search failed");
                    failures.push(SourceFailure {
                        source_id,
                        source_name,
                        error,
                    });
                }
                Ok(Some(Err(join_err))) => {
                    tracing::error!(%join_err, "search task panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    // Deadline hit: keep what finished, record the rest.
                    let pending = tasks.len();
                    tasks.abort_all();
                    tracing::warn!(pending, "search deadline reached with sources still running");
                    break;
                }
            }
        }

        let mut hits: Vec<NovelHit> = merged.into_values().collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(max_results);

        SearchOutcome {
            hits,
            failures,
            cached,
        }
    }
}

/// Dedup key: lowercased title/author with punctuation stripped and
/// whitespace collapsed.
pub fn normalize_for_dedup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_was_space = false;
        } else if c.is_whitespace() && !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

fn merge_hit(merged: &mut HashMap<(String, String), NovelHit>, hit: NovelHit) {
    let key = (
        normalize_for_dedup(&hit.title),
        normalize_for_dedup(hit.author.as_deref().unwrap_or_default()),
    );
    match merged.get_mut(&key) {
        // First arrival wins ties; only a strictly better score replaces.
        Some(existing) => {
            if hit.score > existing.score {
                *existing = hit;
            }
        }
        None => {
            merged.insert(key, hit);
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

/// Keyword tokens: split on whitespace and non-alphanumerics; tokens
/// shorter than 2 chars survive only if they are CJK.
pub fn tokenize(keyword: &str) -> Vec<String> {
    keyword
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .filter(|token| token.chars().count() >= 2 || token.chars().all(is_cjk))
        .map(str::to_string)
        .collect()
}

/// Relevance score: exact/partial title and author matches dominate, the
/// latest-chapter text contributes a trickle, and a tiny jitter breaks
/// stable-ordering ties.
pub fn score_hit(hit: &NovelHit, tokens: &[String]) -> f64 {
    let title = hit.title.to_lowercase();
    let author = hit.author.as_deref().unwrap_or_default().to_lowercase();
    let latest = hit
        .latest_chapter
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    let mut score = 0.0;
    for token in tokens {
        if title == *token {
            score += 100.0;
        } else if title.contains(token.as_str()) {
            let ratio = token.chars().count() as f64 / title.chars().count().max(1) as f64;
            score += 50.0 * ratio;
        }

        if author == *token {
            score += 30.0;
        } else if !author.is_empty() && author.contains(token.as_str()) {
            score += 20.0;
        }

        if !latest.is_empty() && latest.contains(token.as_str()) {
            score += 10.0;
        }
    }

    score + rand::thread_rng().gen_range(0.0..0.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(source_id: u32, title: &str, author: Option<&str>) -> NovelHit {
        NovelHit {
            source_id,
            source_name: format!("source-{source_id}"),
            detail_url: format!("http://s{source_id}/book"),
            title: title.to_string(),
            author: author.map(str::to_string),
            latest_chapter: None,
            score: 0.0,
        }
    }

    #[test]
    fn tokenize_splits_and_filters() {
        assert_eq!(tokenize("斗破苍穹 天蚕土豆"), vec!["斗破苍穹", "天蚕土豆"]);
        assert_eq!(tokenize("the lord of x"), vec!["the", "lord", "of"]);
        assert_eq!(tokenize("斗 a"), vec!["斗"]);
        assert!(tokenize("  ").is_empty());
    }

    #[test]
    fn exact_title_match_dominates() {
        let tokens = tokenize("斗破苍穹");
        let exact = score_hit(&hit(1, "斗破苍穹", Some("天蚕土豆")), &tokens);
        let partial = score_hit(&hit(1, "斗破苍穹前传之药老传奇", Some("天蚕土豆")), &tokens);
        let unrelated = score_hit(&hit(1, "完全无关", Some("别人")), &tokens);
        assert!(exact > partial);
        assert!(partial > unrelated);
        assert!(exact >= 100.0);
        assert!(unrelated < 1.0);
    }

    #[test]
    fn author_matches_score() {
        let tokens = tokenize("天蚕土豆");
        let by_author = score_hit(&hit(1, "武动乾坤", Some("天蚕土豆")), &tokens);
        assert!(by_author >= 30.0);
    }

    #[test]
    fn dedup_normalization() {
        assert_eq!(normalize_for_dedup("斗破苍穹"), normalize_for_dedup("斗破苍穹!"));
        assert_eq!(
            normalize_for_dedup("The  Lord\tof Rings"),
            "the lord of rings"
        );
    }

    #[test]
    fn merge_keeps_higher_score_then_first_arrival() {
        let mut merged = HashMap::new();

        let mut first = hit(1, "斗破苍穹", Some("天蚕土豆"));
        first.score = 100.0;
        merge_hit(&mut merged, first);

        // Same book from another source, same score: first arrival stays.
        let mut tie = hit(2, "斗破苍穹", Some("天蚕土豆"));
        tie.score = 100.0;
        merge_hit(&mut merged, tie);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.values().next().unwrap().source_id, 1);

        // Strictly higher score replaces.
        let mut better = hit(3, "斗破苍穹!", Some("天蚕土豆"));
        better.score = 150.0;
        merge_hit(&mut merged, better);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.values().next().unwrap().source_id, 3);
    }

    #[test]
    fn different_books_do_not_collide() {
        let mut merged = HashMap::new();
        merge_hit(&mut merged, hit(1, "斗破苍穹", Some("天蚕土豆")));
        merge_hit(&mut merged, hit(1, "武动乾坤", Some("天蚕土豆")));
        assert_eq!(merged.len(), 2);
    }
}
