//! Logo caching stage.
//!
//! Distinct logo URLs are fetched with bounded parallelism, honoring HTTP
//! cache validators, and stored under a content-addressed name: the
//! lowercase hex SHA-256 of the URL's canonical bytes, original extension
//! preserved when detectable. Channel logo references are rewritten to
//! the cached path; fetch failures keep the original URL. A background
//! sweep expires entries older than the configured retention.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures::stream::StreamExt;
use sha2::{Digest, Sha256};

use super::model::Channel;

/// Extensions preserved on cached files.
const KNOWN_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "webp", "svg"];

/// Content-addressed logo cache.
pub struct LogoCache {
    dir: PathBuf,
    client: reqwest::Client,
    parallelism: usize,
    retention: Duration,
}

impl LogoCache {
    #[must_use]
    pub fn new(dir: PathBuf, parallelism: usize, retention_days: u64) -> Self {
        Self {
            dir,
            client: reqwest::Client::new(),
            parallelism: parallelism.max(1),
            retention: Duration::from_secs(retention_days * 24 * 3600),
        }
    }

    /// Cache file name for a URL: sha256 hex plus preserved extension.
    #[must_use]
    pub fn cached_name(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let hex = hex::encode(digest);
        match extension_of(url) {
            Some(ext) => format!("{hex}.{ext}"),
            None => hex,
        }
    }

    /// Fetches every distinct logo URL and rewrites channel references to
    /// `logos/<digest>[.<ext>]`. Failures are logged; the original URL
    /// stays in place.
    pub async fn cache_channel_logos(&self, channels: &mut [Channel]) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            log::warn!("[Logos] cannot create cache dir: {e}; skipping logo caching");
            return;
        }

        let mut distinct: Vec<String> = Vec::new();
        {
            let mut seen = std::collections::HashSet::new();
            for channel in channels.iter() {
                if let Some(url) = &channel.logo_url {
                    if !url.is_empty() && seen.insert(url.clone()) {
                        distinct.push(url.clone());
                    }
                }
            }
        }

        let results: Vec<(String, Option<String>)> = futures::stream::iter(distinct)
            .map(|url| async move {
                let cached = self.fetch_one(&url).await;
                (url, cached)
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let resolved: HashMap<String, String> = results
            .into_iter()
            .filter_map(|(url, cached)| cached.map(|name| (url, format!("logos/{name}"))))
            .collect();

        for channel in channels.iter_mut() {
            if let Some(url) = &channel.logo_url {
                if let Some(cached) = resolved.get(url) {
                    channel.logo_url = Some(cached.clone());
                }
            }
        }
    }

    /// Fetches one URL into the cache. Returns the cached file name, or
    /// `None` on failure. An existing fresh file short-circuits via
    /// If-Modified-Since.
    async fn fetch_one(&self, url: &str) -> Option<String> {
        let name = Self::cached_name(url);
        let path = self.dir.join(&name);

        let mut request = self.client.get(url);
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if let Ok(modified) = meta.modified() {
                request = request.header(
                    reqwest::header::IF_MODIFIED_SINCE,
                    httpdate(modified),
                );
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("[Logos] fetch failed for {url}: {e}");
                return None;
            }
        };

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Some(name);
        }
        if !response.status().is_success() {
            log::warn!("[Logos] fetch for {url} returned {}", response.status());
            return None;
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("[Logos] body read failed for {url}: {e}");
                return None;
            }
        };

        // Write-then-rename keeps concurrent readers off partial files.
        let tmp = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            log::warn!("[Logos] write failed for {url}: {e}");
            return None;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            log::warn!("[Logos] rename failed for {url}: {e}");
            let _ = tokio::fs::remove_file(&tmp).await;
            return None;
        }
        Some(name)
    }

    /// Removes cache entries older than the retention window. Returns the
    /// number of files removed.
    pub async fn sweep(&self) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        let cutoff = SystemTime::now() - self.retention;
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let old = meta
                .modified()
                .map(|modified| modified < cutoff)
                .unwrap_or(false);
            if old && tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("[Logos] sweep removed {removed} expired logos");
        }
        removed
    }

    /// Spawns the periodic retention sweep.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                cache.sweep().await;
            }
        })
    }
}

fn extension_of(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = Path::new(path).extension()?.to_str()?;
    KNOWN_EXTENSIONS
        .iter()
        .find(|known| known.eq_ignore_ascii_case(ext))
        .copied()
}

/// RFC 7231 HTTP-date for If-Modified-Since.
fn httpdate(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_name_is_sha256_hex_with_extension() {
        let name = LogoCache::cached_name("http://example.com/logo.png?size=64");
        assert!(name.ends_with(".png"));
        let hex_part = name.trim_end_matches(".png");
        assert_eq!(hex_part.len(), 64);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn unknown_extension_is_dropped() {
        let name = LogoCache::cached_name("http://example.com/logo.exe");
        assert_eq!(name.len(), 64);
    }

    #[test]
    fn same_url_same_name() {
        let a = LogoCache::cached_name("http://example.com/a.png");
        let b = LogoCache::cached_name("http://example.com/a.png");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LogoCache::new(dir.path().to_path_buf(), 2, 30);
        let fresh = dir.path().join("fresh.png");
        tokio::fs::write(&fresh, b"x").await.expect("write");
        // Nothing is older than 30 days in a fresh tempdir.
        assert_eq!(cache.sweep().await, 0);
        assert!(fresh.exists());
    }
}
