//! Content-addressed disk store for downloaded media, with age- and
//! size-bounded eviction. Only media bytes land here, never page HTML.

use crate::error::Result;
use crate::fetcher::MediaFetcher;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Sidecar metadata stored next to each entry's data file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    content_type: String,
    /// Unix seconds at creation, used by the age sweep.
    created: u64,
}

#[derive(Debug)]
struct EntryInfo {
    key: String,
    created: u64,
    size: u64,
}

pub struct MediaCache {
    dir: PathBuf,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MediaCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(MediaCache { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable key over target + referer; some origins serve different bytes
    /// depending on the referer, so it participates in the address.
    fn key(url: &Url, referer: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(referer.unwrap_or("").as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.meta", key))
    }

    /// Cached bytes and content type, or None when this key was never
    /// stored (or its files were evicted).
    async fn lookup(&self, key: &str) -> Option<(Bytes, String)> {
        let data = tokio::fs::read(self.data_path(key)).await.ok()?;
        let content_type = match tokio::fs::read(self.meta_path(key)).await {
            Ok(raw) => serde_json::from_slice::<EntryMeta>(&raw)
                .map(|m| m.content_type)
                .unwrap_or_else(|_| "application/octet-stream".to_string()),
            Err(_) => "application/octet-stream".to_string(),
        };
        Some((Bytes::from(data), content_type))
    }

    /// Persist an entry. Writes go to a temporary file first and are then
    /// renamed into place, so a concurrent fetch of the same key can never
    /// leave a half-written file behind.
    async fn store(&self, key: &str, bytes: &Bytes, content_type: &str) -> Result<()> {
        static WRITE_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = WRITE_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let tmp_suffix = format!(".tmp-{}-{}", std::process::id(), seq);

        let data_tmp = self.dir.join(format!("{}{}", key, tmp_suffix));
        tokio::fs::write(&data_tmp, bytes).await?;
        tokio::fs::rename(&data_tmp, self.data_path(key)).await?;

        let meta = EntryMeta {
            content_type: content_type.to_string(),
            created: now_secs(),
        };
        let meta_tmp = self.dir.join(format!("{}.meta{}", key, tmp_suffix));
        let meta_json = serde_json::to_vec(&meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&meta_tmp, meta_json).await?;
        tokio::fs::rename(&meta_tmp, self.meta_path(key)).await?;
        Ok(())
    }

    /// Cache-through get: hit from disk, else fetch upstream, persist and
    /// return. A failed persist still returns the fetched bytes.
    pub async fn get(
        &self,
        url: &Url,
        referer: Option<&str>,
        fetcher: &MediaFetcher,
    ) -> Result<(Bytes, String)> {
        let key = Self::key(url, referer);

        if let Some(hit) = self.lookup(&key).await {
            tracing::debug!(url = %url, "media cache hit");
            return Ok(hit);
        }

        let (bytes, content_type) = fetcher.fetch_buffered(url, referer).await?;
        if let Err(err) = self.store(&key, &bytes, &content_type).await {
            tracing::warn!(url = %url, %err, "failed to persist media cache entry");
        }
        Ok((bytes, content_type))
    }

    async fn entries(&self) -> Result<Vec<EntryInfo>> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            // data files are bare hex keys; skip sidecars and leftovers
            if name.contains('.') {
                continue;
            }
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            let created = match tokio::fs::read(self.meta_path(&name)).await {
                Ok(raw) => serde_json::from_slice::<EntryMeta>(&raw)
                    .map(|m| m.created)
                    .unwrap_or(0),
                Err(_) => 0,
            };
            out.push(EntryInfo {
                key: name,
                created,
                size,
            });
        }
        Ok(out)
    }

    async fn remove_entry(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.data_path(key)).await;
        let _ = tokio::fs::remove_file(self.meta_path(key)).await;
    }

    /// Delete entries older than `max_age_days`. Zero means delete
    /// everything, which is how the manual "clear all" action is expressed.
    pub async fn cleanup_old_files(&self, max_age_days: u64) -> Result<usize> {
        let cutoff = now_secs().saturating_sub(max_age_days * 24 * 60 * 60);
        let mut removed = 0;
        for entry in self.entries().await? {
            if max_age_days == 0 || entry.created < cutoff {
                self.remove_entry(&entry.key).await;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, max_age_days, "age sweep removed cache entries");
        }
        Ok(removed)
    }

    /// Delete oldest entries first until the cache fits under
    /// `max_size_mb`. No-op when already under the bound.
    pub async fn cleanup_by_size(&self, max_size_mb: u64) -> Result<usize> {
        let mut entries = self.entries().await?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        let bound = max_size_mb * 1024 * 1024;
        if total <= bound {
            return Ok(0);
        }

        entries.sort_by_key(|e| e.created);
        let mut removed = 0;
        for entry in entries {
            if total <= bound {
                break;
            }
            self.remove_entry(&entry.key).await;
            total = total.saturating_sub(entry.size);
            removed += 1;
        }
        tracing::info!(removed, max_size_mb, "size sweep removed cache entries");
        Ok(removed)
    }

    /// Sum of on-disk data sizes (sidecar metadata not counted).
    pub async fn size_bytes(&self) -> Result<u64> {
        Ok(self.entries().await?.iter().map(|e| e.size).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, MediaCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path()).unwrap();
        (dir, cache)
    }

    async fn seed(cache: &MediaCache, url: &str, bytes: &[u8], created: u64) -> String {
        let key = MediaCache::key(&Url::parse(url).unwrap(), None);
        tokio::fs::write(cache.data_path(&key), bytes).await.unwrap();
        let meta = EntryMeta {
            content_type: "image/png".into(),
            created,
        };
        tokio::fs::write(cache.meta_path(&key), serde_json::to_vec(&meta).unwrap())
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn lookup_returns_stored_bytes_and_type() {
        let (_dir, cache) = cache();
        let key = seed(&cache, "https://x.test/a.png", b"pngbytes", now_secs()).await;
        let (bytes, ct) = cache.lookup(&key).await.unwrap();
        assert_eq!(&bytes[..], b"pngbytes");
        assert_eq!(ct, "image/png");
    }

    #[tokio::test]
    async fn key_depends_on_referer() {
        let url = Url::parse("https://x.test/a.png").unwrap();
        let plain = MediaCache::key(&url, None);
        let with_ref = MediaCache::key(&url, Some("https://site.test/page"));
        assert_ne!(plain, with_ref);
        // and is stable
        assert_eq!(plain, MediaCache::key(&url, None));
    }

    #[tokio::test]
    async fn age_sweep_zero_removes_everything() {
        let (_dir, cache) = cache();
        seed(&cache, "https://x.test/a.png", b"a", now_secs()).await;
        seed(&cache, "https://x.test/b.png", b"b", now_secs()).await;
        let removed = cache.cleanup_old_files(0).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.size_bytes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn age_sweep_keeps_fresh_entries() {
        let (_dir, cache) = cache();
        let old = now_secs() - 10 * 24 * 60 * 60;
        let old_key = seed(&cache, "https://x.test/old.png", b"old", old).await;
        let new_key = seed(&cache, "https://x.test/new.png", b"new", now_secs()).await;

        let removed = cache.cleanup_old_files(7).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.lookup(&old_key).await.is_none());
        assert!(cache.lookup(&new_key).await.is_some());
    }

    #[tokio::test]
    async fn size_sweep_removes_oldest_first() {
        let (_dir, cache) = cache();
        let mb = vec![0u8; 1024 * 1024];
        let oldest = seed(&cache, "https://x.test/1.bin", &mb, 100).await;
        let middle = seed(&cache, "https://x.test/2.bin", &mb, 200).await;
        let newest = seed(&cache, "https://x.test/3.bin", &mb, 300).await;

        let removed = cache.cleanup_by_size(2).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.lookup(&oldest).await.is_none());
        assert!(cache.lookup(&middle).await.is_some());
        assert!(cache.lookup(&newest).await.is_some());
        assert!(cache.size_bytes().await.unwrap() <= 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn size_sweep_is_noop_under_bound() {
        let (_dir, cache) = cache();
        seed(&cache, "https://x.test/a.png", b"tiny", now_secs()).await;
        assert_eq!(cache.cleanup_by_size(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_then_lookup_round_trips() {
        let (_dir, cache) = cache();
        let bytes = Bytes::from_static(b"jpeg body");
        cache.store("abc123", &bytes, "image/jpeg").await.unwrap();
        let (read, ct) = cache.lookup("abc123").await.unwrap();
        assert_eq!(read, bytes);
        assert_eq!(ct, "image/jpeg");
    }
}
