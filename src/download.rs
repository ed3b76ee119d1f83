//! Download orchestration: execute a chapter fetch plan against one source
//! with bounded parallelism and per-chapter retries.
//!
//! Chapters run in batches of K with a randomized sleep between batches.
//! A chapter that fails all its attempts becomes a placeholder in the
//! final artifact instead of failing the task; the caller decides the
//! task's fate from the completed/failed counts. Cancellation is observed
//! at every batch boundary and inside each in-flight fetch.

use std::sync::Arc;

use rand::Rng as _;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::adapter::SourceAdapter;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::backoff_delay;
use crate::toc::ChapterRef;

/// A chapter after the fetch plan ran: either real content or a
/// placeholder recording why the fetch failed.
#[derive(Debug, Clone)]
pub struct FetchedChapter {
    pub order: u32,
    pub title: String,
    pub content: String,
    pub failed: bool,
}

#[derive(Debug)]
pub struct DownloadOutcome {
    /// Chapters in canonical TOC order, placeholders included.
    pub chapters: Vec<FetchedChapter>,
    pub completed: u32,
    pub failed: u32,
}

impl DownloadOutcome {
    /// More than half the chapters failing fails the whole task.
    pub fn failure_is_fatal(&self) -> bool {
        u64::from(self.failed) * 2 > u64::from(self.completed + self.failed)
    }
}

/// Observer for per-chapter progress; the task registry implements this to
/// keep `DownloadTask` snapshots live while a worker runs.
pub trait ProgressSink: Send + Sync {
    fn on_chapter(&self, completed: u32, failed: u32, current_title: &str);
}

/// No-op sink for callers that do not track progress.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn on_chapter(&self, _completed: u32, _failed: u32, _current_title: &str) {}
}

pub fn placeholder_body(reason: &str) -> String {
    format!("【本章下载失败】{reason}")
}

pub struct Orchestrator {
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub async fn download_chapters(
        &self,
        adapter: Arc<SourceAdapter>,
        toc: &[ChapterRef],
        progress: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let total = toc.len();
        let mut chapters: Vec<Option<FetchedChapter>> = vec![None; total];
        let mut completed = 0u32;
        let mut failed = 0u32;
        // An all-failed batch triples the retry base for the next batch,
        // then it decays back.
        let mut retry_base = self.config.chapter_retry_base;

        let batch_size = self.config.download_batch_size.max(1);
        let batch_count = total.div_ceil(batch_size);

        for (batch_index, batch) in toc.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::internal("cancelled"));
            }

            let mut tasks = JoinSet::new();
            for chapter in batch {
                let adapter = Arc::clone(&adapter);
                let chapter = chapter.clone();
                let cancel = cancel.clone();
                let attempts = self.config.chapter_retry_times.max(1);
                let base = retry_base;
                tasks.spawn(async move {
                    let outcome = fetch_one(&adapter, &chapter, attempts, base, &cancel).await;
                    (chapter, outcome)
                });
            }

            let mut batch_failures = 0usize;
            let batch_len = batch.len();
            while let Some(joined) = tasks.join_next().await {
                let (chapter, outcome) = match joined {
                    Ok(pair) => pair,
                    Err(join_err) => {
                        tracing::error!(%join_err, "chapter task panicked");
                        continue;
                    }
                };
                let slot = chapter.order.saturating_sub(1) as usize;
                if slot >= chapters.len() {
                    return Err(Error::internal(format!(
                        "chapter order {} outside plan of {total}",
                        chapter.order
                    )));
                }
                match outcome {
                    Ok(content) => {
                        completed += 1;
                        chapters[slot] = Some(FetchedChapter {
                            order: chapter.order,
                            title: chapter.title.clone(),
                            content,
                            failed: false,
                        });
                    }
                    Err(err) => {
                        failed += 1;
                        batch_failures += 1;
                        tracing::warn!(order = chapter.order, title = %chapter.title, %err, "chapter failed all attempts");
                        chapters[slot] = Some(FetchedChapter {
                            order: chapter.order,
                            title: chapter.title.clone(),
                            content: placeholder_body(&err.to_string()),
                            failed: true,
                        });
                    }
                }
                progress.on_chapter(completed, failed, &chapter.title);
            }

            if cancel.is_cancelled() {
                return Err(Error::internal("cancelled"));
            }

            retry_base = if batch_failures == batch_len && batch_len > 0 {
                self.config.chapter_retry_base * 3
            } else {
                self.config.chapter_retry_base
            };

            if batch_index + 1 < batch_count {
                let sleep = self.between_batch_sleep();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::internal("cancelled")),
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
        }

        let chapters: Vec<FetchedChapter> = chapters.into_iter().flatten().collect();
        if chapters.len() != total {
            return Err(Error::internal(format!(
                "chapter plan lost entries: {} of {total}",
                chapters.len()
            )));
        }

        Ok(DownloadOutcome {
            chapters,
            completed,
            failed,
        })
    }

    fn between_batch_sleep(&self) -> std::time::Duration {
        let min = self.config.batch_sleep_min;
        let max = self.config.batch_sleep_max.max(min);
        if max == min {
            return min;
        }
        let span = (max - min).as_millis() as u64;
        min + std::time::Duration::from_millis(rand::thread_rng().gen_range(0..span))
    }
}

async fn fetch_one(
    adapter: &SourceAdapter,
    chapter: &ChapterRef,
    attempts: u32,
    retry_base: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut last_err = Error::internal("no attempt ran");
    for attempt in 1..=attempts {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::internal("cancelled")),
            fetched = adapter.chapter(&chapter.url) => fetched,
        };
        match fetched {
            Ok(content) => return Ok(content.content),
            Err(err) => {
                tracing::debug!(order = chapter.order, attempt, %err, "chapter attempt failed");
                last_err = err;
            }
        }
        if attempt < attempts {
            let jitter: f64 = rand::thread_rng().gen_range(0.0..0.5);
            let delay = backoff_delay(retry_base, attempt, jitter);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::internal("cancelled")),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
    Err(last_err)
}
