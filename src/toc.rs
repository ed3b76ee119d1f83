//! TOC normalization: turn the raw per-source chapter list into the
//! canonical ordered one.
//!
//! Raw TOCs repeat chapters across pagination, mix navigation links into
//! the chapter list, and disagree with themselves about titles. The
//! normalizer filters noise, deduplicates in three passes (URL, detected
//! chapter number, near-identical title), orders by detected number, and
//! assigns the final contiguous `order`. Canonical order is produced here
//! exactly once; nothing downstream renumbers.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::adapter::TocEntry;

/// A chapter in the canonical TOC. `order` runs 1..N without gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterRef {
    pub order: u32,
    pub title: String,
    pub url: String,
}

/// Similarity threshold above which two titles are considered the same
/// chapter.
const TITLE_SIMILARITY_THRESHOLD: f64 = 0.9;

pub fn normalize(raw: Vec<TocEntry>) -> Vec<ChapterRef> {
    let noise = noise_patterns();
    let number_patterns = chapter_number_patterns();

    let mut entries: Vec<(TocEntry, Option<u64>)> = raw
        .into_iter()
        .filter_map(|mut entry| {
            entry.title = entry.title.trim().to_string();
            if entry.title.is_empty() || Url::parse(&entry.url).is_err() {
                return None;
            }
            if is_noise_title(&entry.title, &noise) {
                return None;
            }
            let number = detect_chapter_number(&entry.title, &number_patterns);
            Some((entry, number))
        })
        .collect();

    entries = dedup_by_url(entries);
    entries = dedup_by_number(entries);
    entries = dedup_by_similarity(entries);

    // Numbered chapters sort by their number; unnumbered ones keep their
    // relative order after the numbered block.
    let mut numbered: Vec<(u64, usize, TocEntry)> = Vec::new();
    let mut unnumbered: Vec<(usize, TocEntry)> = Vec::new();
    for (idx, (entry, number)) in entries.into_iter().enumerate() {
        match number {
            Some(n) => numbered.push((n, idx, entry)),
            None => unnumbered.push((idx, entry)),
        }
    }
    numbered.sort_by_key(|(n, idx, _)| (*n, *idx));

    numbered
        .into_iter()
        .map(|(_, _, entry)| entry)
        .chain(unnumbered.into_iter().map(|(_, entry)| entry))
        .enumerate()
        .map(|(idx, entry)| ChapterRef {
            order: idx as u32 + 1,
            title: entry.title,
            url: entry.url,
        })
        .collect()
}

fn noise_patterns() -> Vec<Regex> {
    [
        r"^第$",
        r"^章$",
        r"^目录$",
        r"^返回.*$",
        r"^上一页$",
        r"^下一页$",
        r"^\d+$",
        r"^[\p{P}\p{S}]+$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("noise pattern compiles"))
    .collect()
}

fn is_noise_title(title: &str, noise: &[Regex]) -> bool {
    noise.iter().any(|p| p.is_match(title))
}

struct NumberPatterns {
    cjk_heading: Regex,
    arabic_heading: Regex,
    leading_index: Regex,
    volume: Regex,
}

fn chapter_number_patterns() -> NumberPatterns {
    NumberPatterns {
        cjk_heading: Regex::new(r"第([零〇一二两三四五六七八九十百千万]+)[章节卷回部篇话]")
            .expect("cjk heading pattern compiles"),
        arabic_heading: Regex::new(r"第\s*(\d+)\s*[章节卷回部篇话]")
            .expect("arabic heading pattern compiles"),
        leading_index: Regex::new(r"^(\d+)[\s.、:：]").expect("leading index pattern compiles"),
        volume: Regex::new(r"卷\s*(\d+)").expect("volume pattern compiles"),
    }
}

/// Extract the chapter number a title announces, if any.
fn detect_chapter_number(title: &str, patterns: &NumberPatterns) -> Option<u64> {
    if let Some(captures) = patterns.arabic_heading.captures(title) {
        return captures[1].parse().ok();
    }
    if let Some(captures) = patterns.cjk_heading.captures(title) {
        return cjk_numeral_value(&captures[1]);
    }
    if let Some(captures) = patterns.leading_index.captures(title) {
        return captures[1].parse().ok();
    }
    if let Some(captures) = patterns.volume.captures(title) {
        return captures[1].parse().ok();
    }
    None
}

/// Value of a CJK numeral like 一百二十三. Supports 十/百/千/万 positions.
fn cjk_numeral_value(text: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut section = 0u64;
    let mut current = 0u64;
    let mut any = false;

    for c in text.chars() {
        let digit = match c {
            '零' | '〇' => Some(0),
            '一' => Some(1),
            '二' | '两' => Some(2),
            '三' => Some(3),
            '四' => Some(4),
            '五' => Some(5),
            '六' => Some(6),
            '七' => Some(7),
            '八' => Some(8),
            '九' => Some(9),
            _ => None,
        };
        if let Some(d) = digit {
            current = d;
            any = true;
            continue;
        }
        match c {
            '万' => {
                let mut value = section + current;
                if value == 0 {
                    value = 1;
                }
                total += value * 10_000;
                section = 0;
                current = 0;
                any = true;
            }
            '十' | '百' | '千' => {
                let unit = match c {
                    '十' => 10,
                    '百' => 100,
                    _ => 1000,
                };
                // Bare 十 means 10; 二十 means 20.
                let factor = if current == 0 { 1 } else { current };
                section += factor * unit;
                current = 0;
                any = true;
            }
            _ => return None,
        }
    }

    any.then_some(total + section + current)
}

/// How "canonical" a title looks: has a detectable number, is longer, and
/// carries fewer non-word characters, in that priority.
fn title_quality(title: &str, number: Option<u64>) -> (bool, usize, i64) {
    let non_word = title
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count() as i64;
    (number.is_some(), title.chars().count(), -non_word)
}

fn dedup_by_url(entries: Vec<(TocEntry, Option<u64>)>) -> Vec<(TocEntry, Option<u64>)> {
    let mut slot_for_url: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<Option<(TocEntry, Option<u64>)>> = Vec::with_capacity(entries.len());

    for (entry, number) in entries {
        match slot_for_url.get(&entry.url) {
            None => {
                slot_for_url.insert(entry.url.clone(), kept.len());
                kept.push(Some((entry, number)));
            }
            Some(&slot) => {
                let replace = kept[slot].as_ref().is_some_and(|(existing, existing_number)| {
                    title_quality(&entry.title, number)
                        > title_quality(&existing.title, *existing_number)
                });
                if replace {
                    kept[slot] = Some((entry, number));
                }
            }
        }
    }
    kept.into_iter().flatten().collect()
}

fn dedup_by_number(entries: Vec<(TocEntry, Option<u64>)>) -> Vec<(TocEntry, Option<u64>)> {
    let mut slot_for_number: HashMap<u64, usize> = HashMap::new();
    let mut kept: Vec<Option<(TocEntry, Option<u64>)>> = Vec::with_capacity(entries.len());

    for (entry, number) in entries {
        let Some(n) = number else {
            kept.push(Some((entry, number)));
            continue;
        };
        match slot_for_number.get(&n) {
            None => {
                slot_for_number.insert(n, kept.len());
                kept.push(Some((entry, number)));
            }
            Some(&slot) => {
                let replace = kept[slot].as_ref().is_some_and(|(existing, existing_number)| {
                    title_quality(&entry.title, number)
                        > title_quality(&existing.title, *existing_number)
                });
                if replace {
                    kept[slot] = Some((entry, number));
                }
            }
        }
    }
    kept.into_iter().flatten().collect()
}

fn dedup_by_similarity(entries: Vec<(TocEntry, Option<u64>)>) -> Vec<(TocEntry, Option<u64>)> {
    let mut kept: Vec<(TocEntry, Option<u64>)> = Vec::with_capacity(entries.len());
    for (entry, number) in entries {
        let duplicate = kept.iter().any(|(existing, existing_number)| {
            // Distinct detected numbers are distinct chapters even when the
            // titles are one edit apart (第一章 vs 第二章).
            if let (Some(a), Some(b)) = (existing_number, number.as_ref()) {
                if a != b {
                    return false;
                }
            }
            title_similarity(&existing.title, &entry.title) >= TITLE_SIMILARITY_THRESHOLD
        });
        if !duplicate {
            kept.push((entry, number));
        }
    }
    kept
}

/// Normalized Levenshtein similarity in [0, 1].
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
    let b: Vec<char> = b.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let max_len = a.len().max(b.len());
    let distance = levenshtein(&a, &b);
    1.0 - distance as f64 / max_len as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, url: &str) -> TocEntry {
        TocEntry {
            title: title.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn orders_are_contiguous_and_urls_unique() {
        let raw = vec![
            entry("第三章 试炼", "http://s/3"),
            entry("第一章 出发", "http://s/1"),
            entry("第二章 相遇", "http://s/2"),
            entry("第一章 出发", "http://s/1"),
        ];
        let toc = normalize(raw);
        assert_eq!(toc.len(), 3);
        let orders: Vec<u32> = toc.iter().map(|c| c.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(toc[0].title, "第一章 出发");
        assert_eq!(toc[2].title, "第三章 试炼");
        let mut urls: Vec<&str> = toc.iter().map(|c| c.url.as_str()).collect();
        urls.sort();
        urls.dedup();
        assert_eq!(urls.len(), 3);
    }

    #[test]
    fn noise_titles_are_dropped() {
        let raw = vec![
            entry("下一页", "http://s/next"),
            entry("目录", "http://s/index"),
            entry("123", "http://s/123"),
            entry("???", "http://s/q"),
            entry("第1章 正文", "http://s/1"),
            entry("返回书页", "http://s/back"),
        ];
        let toc = normalize(raw);
        assert_eq!(toc.len(), 1);
        assert_eq!(toc[0].title, "第1章 正文");
    }

    #[test]
    fn invalid_urls_are_dropped() {
        let raw = vec![
            entry("第1章", "not a url"),
            entry("第2章", "http://s/2"),
        ];
        let toc = normalize(raw);
        assert_eq!(toc.len(), 1);
        assert_eq!(toc[0].url, "http://s/2");
    }

    #[test]
    fn url_dedup_keeps_more_canonical_title() {
        let raw = vec![
            entry("相遇", "http://s/2"),
            entry("第二章 相遇", "http://s/2"),
        ];
        let toc = normalize(raw);
        assert_eq!(toc.len(), 1);
        assert_eq!(toc[0].title, "第二章 相遇");
    }

    #[test]
    fn number_dedup_collapses_same_chapter_from_different_urls() {
        let raw = vec![
            entry("第5章 夜行", "http://s/5"),
            entry("第五章 夜行(二更)", "http://s/5-repost"),
        ];
        let toc = normalize(raw);
        assert_eq!(toc.len(), 1);
    }

    #[test]
    fn similar_titles_keep_the_earlier_entry() {
        let raw = vec![
            entry("楔子 风雪夜归人未眠时", "http://s/a"),
            entry("楔子 风雪夜归人未眠时。", "http://s/b"),
        ];
        let toc = normalize(raw);
        assert_eq!(toc.len(), 1);
        assert_eq!(toc[0].url, "http://s/a");
    }

    #[test]
    fn adjacent_numbered_chapters_are_not_merged() {
        let raw = vec![
            entry("第一章", "http://s/1"),
            entry("第二章", "http://s/2"),
        ];
        let toc = normalize(raw);
        assert_eq!(toc.len(), 2);
    }

    #[test]
    fn unnumbered_entries_follow_numbered_in_original_order() {
        let raw = vec![
            entry("番外 未来", "http://s/extra2"),
            entry("第二章 出窍", "http://s/2"),
            entry("楔子引言", "http://s/extra1"),
            entry("第一章 入梦", "http://s/1"),
        ];
        let toc = normalize(raw);
        let titles: Vec<&str> = toc.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["第一章 入梦", "第二章 出窍", "番外 未来", "楔子引言"]
        );
        assert_eq!(toc.last().unwrap().order, 4);
    }

    #[test]
    fn detects_number_formats() {
        let patterns = chapter_number_patterns();
        assert_eq!(detect_chapter_number("第12章 风起", &patterns), Some(12));
        assert_eq!(
            detect_chapter_number("第一百二十三章 决战", &patterns),
            Some(123)
        );
        assert_eq!(detect_chapter_number("7. 暗流", &patterns), Some(7));
        assert_eq!(detect_chapter_number("卷 3 终章", &patterns), Some(3));
        assert_eq!(detect_chapter_number("尾声", &patterns), None);
    }

    #[test]
    fn cjk_numerals() {
        assert_eq!(cjk_numeral_value("十"), Some(10));
        assert_eq!(cjk_numeral_value("十五"), Some(15));
        assert_eq!(cjk_numeral_value("二十"), Some(20));
        assert_eq!(cjk_numeral_value("一百二十三"), Some(123));
        assert_eq!(cjk_numeral_value("两千零一"), Some(2001));
        assert_eq!(cjk_numeral_value("三万"), Some(30_000));
        assert_eq!(cjk_numeral_value("abc"), None);
    }

    #[test]
    fn similarity_metric() {
        assert!(title_similarity("第一章 出发", "第一章 出发") >= 1.0);
        assert!(title_similarity("第一章 出发", "第一章出发") >= 0.9);
        assert!(title_similarity("第一章 出发", "完全不同的标题") < 0.5);
    }

    #[test]
    fn thirty_entry_seed_scenario() {
        // 30 raw entries: 12 duplicates by url, 3 empty titles, 1 "下一页".
        let mut raw = Vec::new();
        for i in 1..=14 {
            raw.push(entry(&format!("第{i}章 内容{i}"), &format!("http://s/{i}")));
        }
        raw.push(entry("尾声", "http://s/15"));
        for i in 1..=12 {
            raw.push(entry(&format!("第{i}章 内容{i}"), &format!("http://s/{i}")));
        }
        for i in 0..3 {
            raw.push(entry("   ", &format!("http://s/empty{i}")));
        }
        raw.push(entry("下一页", "http://s/next"));
        assert_eq!(raw.len(), 30);

        let toc = normalize(raw);
        assert_eq!(toc.len(), 15);
        for (idx, chapter) in toc.iter().enumerate() {
            assert_eq!(chapter.order, idx as u32 + 1);
        }
    }
}
