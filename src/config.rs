//! Engine tunables. Everything has a default; the binary overrides what its
//! flags cover and passes the result down as part of the app state.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `*.json` rule files.
    pub rules_dir: PathBuf,
    /// Final artifacts land here.
    pub download_dir: PathBuf,
    /// Two-tier blob cache root.
    pub cache_dir: PathBuf,

    /// Global cap on in-flight outbound HTTP requests.
    pub max_concurrent_requests: usize,
    /// Per-source search timeout; the aggregate deadline caps it further.
    pub search_timeout: Duration,
    /// Overall search deadline.
    pub search_deadline: Duration,
    /// Hits kept per source before aggregation.
    pub max_hits_per_source: usize,
    /// Default result cap for `/search`; requests may lower or raise it up
    /// to `max_results_limit`.
    pub default_max_results: usize,
    pub max_results_limit: usize,

    /// Chapter fetches per download batch.
    pub download_batch_size: usize,
    /// Attempts per chapter (including the first).
    pub chapter_retry_times: u32,
    /// Base delay between chapter retry attempts.
    pub chapter_retry_base: Duration,
    /// Between-batch sleep range to dampen bot detection.
    pub batch_sleep_min: Duration,
    pub batch_sleep_max: Duration,
    /// TOC pagination is followed at most this many pages deep.
    pub max_toc_pages: usize,
    /// Cached chapter bodies shorter than this are treated as misses.
    pub min_chapter_len: usize,

    /// Memory cache entry cap.
    pub cache_memory_entries: usize,

    /// Completed tasks are kept at least this long before GC.
    pub task_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from("rules"),
            download_dir: PathBuf::from("downloads"),
            cache_dir: PathBuf::from("cache"),
            max_concurrent_requests: 5,
            search_timeout: Duration::from_secs(15),
            search_deadline: Duration::from_secs(20),
            max_hits_per_source: 2,
            default_max_results: 30,
            max_results_limit: 100,
            download_batch_size: 10,
            chapter_retry_times: 3,
            chapter_retry_base: Duration::from_secs(1),
            batch_sleep_min: Duration::from_secs(1),
            batch_sleep_max: Duration::from_secs(3),
            max_toc_pages: 50,
            min_chapter_len: 200,
            cache_memory_entries: 1000,
            task_retention: Duration::from_secs(3600),
        }
    }
}
