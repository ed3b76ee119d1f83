//! Two-tier blob cache: an in-memory LRU in front of content-addressed
//! files on disk.
//!
//! Disk entries live at `{dir}/{hex(sha256(key))}` with a JSON `.meta`
//! sidecar recording insertion time and TTL. A `get` only returns a value
//! both tiers consider unexpired; stale entries are evicted lazily. Misses
//! for the same key are coalesced: the first caller fetches upstream while
//! concurrent callers wait and reuse its result.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::Result;

pub const SEARCH_TTL: Duration = Duration::from_secs(30 * 60);
pub const DETAIL_TTL: Duration = Duration::from_secs(2 * 3600);
pub const TOC_TTL: Duration = Duration::from_secs(2 * 3600);
pub const CHAPTER_TTL: Duration = Duration::from_secs(24 * 3600);

pub fn search_key(source_id: u32, keyword: &str) -> String {
    let normalized = keyword.trim().to_lowercase();
    format!("search|{source_id}|{normalized}")
}

pub fn detail_key(detail_url: &str) -> String {
    format!("detail|{detail_url}")
}

pub fn toc_key(detail_url: &str) -> String {
    format!("toc|{detail_url}")
}

pub fn chapter_key(chapter_url: &str) -> String {
    format!("chapter|{chapter_url}")
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    bytes: Arc<Vec<u8>>,
    inserted_at: u64,
    ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    inserted_at: u64,
    ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub disk_bytes: u64,
}

pub struct Cache {
    dir: PathBuf,
    memory: Mutex<LruCache<String, MemoryEntry>>,
    /// Per-key single-flight locks for miss coalescing.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn expired(inserted_at: u64, ttl_secs: u64, now: u64) -> bool {
    now.saturating_sub(inserted_at) > ttl_secs
}

fn file_name_for(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

impl Cache {
    pub fn new(dir: impl Into<PathBuf>, memory_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(memory_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            dir: dir.into(),
            memory: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(file_name_for(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.meta", file_name_for(key)))
    }

    /// Unexpired value for the key, if any tier has one.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.get_valid(key, 0).await
    }

    /// Like [`Cache::get`] but treats entries shorter than `min_len` as
    /// misses. Guards chapter reads against truncated bodies.
    pub async fn get_valid(&self, key: &str, min_len: usize) -> Option<Arc<Vec<u8>>> {
        let now = now_secs();

        {
            let mut memory = self.memory.lock().await;
            match memory.get(key) {
                Some(entry) if !expired(entry.inserted_at, entry.ttl_secs, now) => {
                    if entry.bytes.len() >= min_len {
                        return Some(Arc::clone(&entry.bytes));
                    }
                    return None;
                }
                Some(_) => {
                    memory.pop(key);
                }
                None => {}
            }
        }

        let sidecar = match fs::read(self.meta_path(key)).await {
            Ok(bytes) => match serde_json::from_slice::<Sidecar>(&bytes) {
                Ok(sidecar) => sidecar,
                Err(_) => {
                    self.remove_disk(key).await;
                    return None;
                }
            },
            Err(_) => return None,
        };
        if expired(sidecar.inserted_at, sidecar.ttl_secs, now) {
            self.remove_disk(key).await;
            return None;
        }

        let bytes = match fs::read(self.blob_path(key)).await {
            Ok(bytes) => Arc::new(bytes),
            Err(_) => return None,
        };
        if bytes.len() < min_len {
            return None;
        }

        let mut memory = self.memory.lock().await;
        memory.put(
            key.to_string(),
            MemoryEntry {
                bytes: Arc::clone(&bytes),
                inserted_at: sidecar.inserted_at,
                ttl_secs: sidecar.ttl_secs,
            },
        );
        Some(bytes)
    }

    /// Write the value into both tiers. Disk failures are logged, not
    /// fatal: the cache is best-effort.
    pub async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        let inserted_at = now_secs();
        let ttl_secs = ttl.as_secs();
        let bytes = Arc::new(bytes);

        {
            let mut memory = self.memory.lock().await;
            memory.put(
                key.to_string(),
                MemoryEntry {
                    bytes: Arc::clone(&bytes),
                    inserted_at,
                    ttl_secs,
                },
            );
        }

        if let Err(err) = self.write_disk(key, &bytes, inserted_at, ttl_secs).await {
            tracing::warn!(%err, "disk cache write failed");
        }
    }

    async fn write_disk(
        &self,
        key: &str,
        bytes: &[u8],
        inserted_at: u64,
        ttl_secs: u64,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create cache dir: {}", self.dir.display()))?;

        let blob_path = self.blob_path(key);
        write_atomic(&blob_path, bytes).await?;

        let sidecar = serde_json::to_vec(&Sidecar {
            inserted_at,
            ttl_secs,
        })
        .context("serialize cache sidecar")?;
        write_atomic(&self.meta_path(key), &sidecar).await?;
        Ok(())
    }

    async fn remove_disk(&self, key: &str) {
        let _ = fs::remove_file(self.blob_path(key)).await;
        let _ = fs::remove_file(self.meta_path(key)).await;
    }

    /// Single-flight fetch: one upstream call per key no matter how many
    /// concurrent callers miss on it.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        min_len: usize,
        fetch: F,
    ) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>>>,
    {
        if let Some(hit) = self.get_valid(key, min_len).await {
            return Ok(hit);
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        let _guard = gate.lock().await;
        // A concurrent fetch may have filled the cache while we waited.
        if let Some(hit) = self.get_valid(key, min_len).await {
            self.forget_inflight(key).await;
            return Ok(hit);
        }

        let outcome = fetch().await;
        self.forget_inflight(key).await;
        let bytes = outcome?;
        self.put(key, bytes, ttl).await;

        self.get_valid(key, min_len).await.ok_or_else(|| {
            crate::error::Error::internal(format!("cache rejected freshly fetched entry for {key}"))
        })
    }

    async fn forget_inflight(&self, key: &str) {
        let mut inflight = self.inflight.lock().await;
        inflight.remove(key);
    }

    /// Drop everything from both tiers; returns the number of entries
    /// removed (memory entries + disk blobs).
    pub async fn clear(&self) -> usize {
        let mut cleared = {
            let mut memory = self.memory.lock().await;
            let count = memory.len();
            memory.clear();
            count
        };

        if let Ok(mut entries) = fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.ends_with(".meta") {
                    let _ = fs::remove_file(entry.path()).await;
                } else {
                    cleared += 1;
                    let _ = fs::remove_file(entry.path()).await;
                }
            }
        }
        cleared
    }

    pub async fn stats(&self) -> CacheStats {
        let memory_entries = self.memory.lock().await.len();
        let mut disk_entries = 0;
        let mut disk_bytes = 0;
        if let Ok(mut entries) = fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_name().to_string_lossy().ends_with(".meta") {
                    continue;
                }
                disk_entries += 1;
                if let Ok(meta) = entry.metadata().await {
                    disk_bytes += meta.len();
                }
            }
        }
        CacheStats {
            memory_entries,
            disk_entries,
            disk_bytes,
        }
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_cache(entries: usize) -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), entries);
        (dir, cache)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (_dir, cache) = temp_cache(16);
        cache
            .put("chapter|http://a/1", b"content".to_vec(), CHAPTER_TTL)
            .await;
        let got = cache.get("chapter|http://a/1").await.unwrap();
        assert_eq!(&**got, b"content");
    }

    #[tokio::test]
    async fn zero_ttl_entries_are_expired() {
        let (_dir, cache) = temp_cache(16);
        cache.put("k", b"v".to_vec(), Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn short_chapter_bodies_are_misses() {
        let (_dir, cache) = temp_cache(16);
        cache.put("k", b"tiny".to_vec(), CHAPTER_TTL).await;
        assert!(cache.get_valid("k", 200).await.is_none());
        assert!(cache.get_valid("k", 4).await.is_some());
    }

    #[tokio::test]
    async fn disk_tier_survives_memory_loss() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = Cache::new(dir.path(), 16);
            cache.put("k", b"persisted".to_vec(), DETAIL_TTL).await;
        }
        let cache = Cache::new(dir.path(), 16);
        let got = cache.get("k").await.unwrap();
        assert_eq!(&**got, b"persisted");
    }

    #[tokio::test]
    async fn memory_tier_is_lru_bounded() {
        let (_dir, cache) = temp_cache(2);
        cache.put("a", b"1".to_vec(), DETAIL_TTL).await;
        cache.put("b", b"2".to_vec(), DETAIL_TTL).await;
        cache.put("c", b"3".to_vec(), DETAIL_TTL).await;
        let memory = cache.memory.lock().await;
        assert_eq!(memory.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_fetch() {
        let (_dir, cache) = temp_cache(16);
        let cache = Arc::new(cache);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k", CHAPTER_TTL, 0, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(b"fetched once".to_vec())
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            let got = handle.await.unwrap();
            assert_eq!(&**got, b"fetched once");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let (_dir, cache) = temp_cache(16);
        let err = cache
            .get_or_fetch("k", CHAPTER_TTL, 0, || async {
                Err(crate::error::Error::parse("no content"))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no content"));
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn clear_empties_both_tiers() {
        let (_dir, cache) = temp_cache(16);
        cache.put("a", b"1".to_vec(), DETAIL_TTL).await;
        cache.put("b", b"2".to_vec(), DETAIL_TTL).await;
        let cleared = cache.clear().await;
        assert!(cleared >= 2);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_none());
    }

    #[test]
    fn keys_are_namespaced_and_normalized() {
        assert_eq!(search_key(3, "  斗破苍穹 "), "search|3|斗破苍穹");
        assert_ne!(
            file_name_for(&detail_key("http://a/b")),
            file_name_for(&toc_key("http://a/b"))
        );
    }
}
