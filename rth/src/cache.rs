//! Shared download cache for build resources.
//!
//! Every build provider in a session consults the same [`ResourceCache`]:
//! the first request for a URL downloads it, everyone else gets the same
//! local file. The cache is an injectable object rather than a true
//! global so tests (and sessions) can hold isolated instances.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::info;

use rth_common::RetrievalError;
use rth_common::fsutil::hardlink_or_copy;

/// Downloads a resource URL to a local destination.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str, dest: &Path) -> Result<(), RetrievalError>;
}

/// URL-keyed map of downloaded files, shared across concurrent build
/// providers. Single-flight per URL: the full download happens inside the
/// entry's init scope, so a second waiter never sees a partial file.
#[derive(Default)]
pub struct ResourceCache {
    entries: Mutex<HashMap<String, Arc<tokio::sync::OnceCell<PathBuf>>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached file for `url`, downloading it to `dest` if no
    /// entry exists yet. Cached entries are location-stable: a hit is
    /// returned as-is even when the caller asked for a different `dest`.
    ///
    /// A failed download leaves no entry behind, so the next caller
    /// retries.
    pub async fn get_or_download(
        &self,
        url: &str,
        dest: &Path,
        downloader: &dyn Downloader,
    ) -> Result<PathBuf, RetrievalError> {
        if url.is_empty() {
            return Err(RetrievalError::EmptyUrl(dest.display().to_string()));
        }
        let cell = {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            Arc::clone(entries.entry(url.to_string()).or_default())
        };
        let path = cell
            .get_or_try_init(|| async {
                info!("Download {} from {}.", dest.display(), url);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                downloader.download(url, dest).await?;
                Ok::<_, RetrievalError>(dest.to_path_buf())
            })
            .await?;
        Ok(path.clone())
    }

    /// Cached file for `url`, if the download already completed.
    pub fn cached_path(&self, url: &str) -> Option<PathBuf> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(url).and_then(|cell| cell.get().cloned())
    }

    /// True when `path` is a live cache entry. Session cleanup uses this
    /// to avoid deleting files a sibling session may still reference.
    pub fn contains_path(&self, path: &Path) -> bool {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries
            .values()
            .filter_map(|cell| cell.get())
            .any(|cached| cached == path)
    }

    /// Drop every entry. Called at session teardown; cached files on disk
    /// are the owning session's to delete.
    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }
}

/// HTTP(S) downloader streaming to a `.part` file, renamed on completion
/// so an interrupted transfer never masquerades as a finished resource.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<(), RetrievalError> {
        let download_err = |reason: String| RetrievalError::Download {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| download_err(err.to_string()))?;

        let part = dest.with_file_name(format!(
            "{}.part",
            dest.file_name().unwrap_or_default().to_string_lossy()
        ));
        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| download_err(err.to_string()))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        Ok(())
    }
}

/// Downloader for `file://` URLs and plain local paths, used by tests and
/// LAN mirrors. Hard links when possible.
pub struct LocalFileDownloader;

#[async_trait]
impl Downloader for LocalFileDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<(), RetrievalError> {
        let src = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        if !src.exists() {
            return Err(RetrievalError::Download {
                url: url.to_string(),
                reason: "local source not found".to_string(),
            });
        }
        hardlink_or_copy(&src, dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts invocations; writes `content` to the destination.
    struct CountingDownloader {
        calls: AtomicUsize,
        content: &'static [u8],
    }

    impl CountingDownloader {
        fn new(content: &'static [u8]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                content,
            }
        }
    }

    #[async_trait]
    impl Downloader for CountingDownloader {
        async fn download(&self, _url: &str, dest: &Path) -> Result<(), RetrievalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent waiters pile up behind the init lock.
            tokio::task::yield_now().await;
            tokio::fs::write(dest, self.content).await?;
            Ok(())
        }
    }

    struct FailingDownloader;

    #[async_trait]
    impl Downloader for FailingDownloader {
        async fn download(&self, url: &str, _dest: &Path) -> Result<(), RetrievalError> {
            Err(RetrievalError::Download {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn concurrent_requests_download_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResourceCache::new());
        let downloader = Arc::new(CountingDownloader::new(b"payload"));

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = Arc::clone(&cache);
            let downloader = Arc::clone(&downloader);
            let dest = dir.path().join(format!("dest-{i}"));
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_download("http://example.com/suite.zip", &dest, downloader.as_ref())
                    .await
                    .unwrap()
            }));
        }

        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap());
        }

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
        // All callers observe the same file, whichever destination won.
        assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn distinct_urls_download_separately() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new();
        let downloader = CountingDownloader::new(b"x");

        cache
            .get_or_download("http://example.com/a", &dir.path().join("a"), &downloader)
            .await
            .unwrap();
        cache
            .get_or_download("http://example.com/b", &dir.path().join("b"), &downloader)
            .await
            .unwrap();

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_download_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new();
        let dest = dir.path().join("res");

        let err = cache
            .get_or_download("http://example.com/res", &dest, &FailingDownloader)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Download { .. }));
        assert!(cache.cached_path("http://example.com/res").is_none());

        // A later attempt retries and can succeed.
        let downloader = CountingDownloader::new(b"ok");
        let path = cache
            .get_or_download("http://example.com/res", &dest, &downloader)
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn hit_returns_original_location_for_new_destination() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new();
        let downloader = CountingDownloader::new(b"payload");
        let first = dir.path().join("first");
        let second = dir.path().join("second");

        let a = cache
            .get_or_download("http://example.com/r", &first, &downloader)
            .await
            .unwrap();
        let b = cache
            .get_or_download("http://example.com/r", &second, &downloader)
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
        assert!(!second.exists());
        assert!(cache.contains_path(&first));
        assert!(!cache.contains_path(&second));
    }

    #[tokio::test]
    async fn empty_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new();
        let err = cache
            .get_or_download("", &dir.path().join("x"), &LocalFileDownloader)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::EmptyUrl(_)));
    }

    #[tokio::test]
    async fn local_downloader_handles_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"bits").unwrap();
        let dest = dir.path().join("dest.bin");

        LocalFileDownloader
            .download(&format!("file://{}", src.display()), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"bits");
    }
}
