//! Build resource provisioning.
//!
//! A [`ResourceProvider`] materializes every declared [`TestResource`]
//! under the invocation root: download (through the shared cache),
//! hardlink into place, and optionally decompress. Destination paths are
//! validated against the root before any file operation, so a malformed
//! `decompress_dir` like `"../out"` cannot escape the sandbox.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use rth_common::RetrievalError;
use rth_common::fsutil::{hardlink_or_copy, is_contained_in, recursive_delete};
use rth_common::types::TestResource;

use crate::cache::{Downloader, ResourceCache};
use crate::unpack::{Unpacker, unmount_zip};

/// Paths and work claims owned by one session.
///
/// Shared by every provider in the session: claims deduplicate
/// materialization and extraction work, and the created set is what
/// cleanup is allowed to delete. Cache entries shared with sibling
/// sessions are never recorded here.
#[derive(Default)]
pub struct SessionResources {
    claims: Mutex<HashSet<String>>,
    created: Mutex<BTreeSet<PathBuf>>,
}

impl SessionResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a unit of work. Returns false when another provider in the
    /// session already did (or is doing) it.
    fn claim(&self, key: String) -> bool {
        self.claims.lock().expect("claims lock poisoned").insert(key)
    }

    /// Record a path this session is responsible for deleting.
    fn track_created(&self, path: PathBuf) {
        self.created
            .lock()
            .expect("created lock poisoned")
            .insert(path);
    }

    fn drain_created(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.created.lock().expect("created lock poisoned"))
            .into_iter()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn created_paths(&self) -> Vec<PathBuf> {
        self.created
            .lock()
            .expect("created lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Build descriptor handed to the invocation after provisioning.
#[derive(Debug)]
pub struct ProvisionedBuild {
    pub build_id: String,
    pub build_target: String,
    /// Resource name to materialized file or decompression directory.
    pub files: BTreeMap<String, PathBuf>,
    /// Mount points to unmount at cleanup.
    pub zip_mounts: Vec<PathBuf>,
}

/// Provisions the resources of one build into a sandboxed root directory.
pub struct ResourceProvider {
    root_dir: PathBuf,
    resources: Vec<TestResource>,
    build_id: String,
    build_target: String,
    session: Arc<SessionResources>,
    unpacker: Arc<dyn Unpacker>,
}

impl ResourceProvider {
    pub fn new(
        root_dir: PathBuf,
        resources: Vec<TestResource>,
        build_id: String,
        build_target: String,
        session: Arc<SessionResources>,
        unpacker: Arc<dyn Unpacker>,
    ) -> Self {
        Self {
            root_dir,
            resources,
            build_id,
            build_target,
            session,
            unpacker,
        }
    }

    /// Download, materialize, and decompress every declared resource.
    pub async fn fetch_build(
        &self,
        cache: &ResourceCache,
        downloader: &dyn Downloader,
    ) -> Result<ProvisionedBuild, RetrievalError> {
        std::fs::create_dir_all(&self.root_dir)?;
        let mut build = ProvisionedBuild {
            build_id: self.build_id.clone(),
            build_target: self.build_target.clone(),
            files: BTreeMap::new(),
            zip_mounts: Vec::new(),
        };

        for resource in &self.resources {
            let dest = resource.file_in(&self.root_dir);
            self.validate_in_root(&dest)?;
            let decompress_dir = resource
                .decompress
                .then(|| resource.decompress_dir_in(&self.root_dir));
            if let Some(dir) = &decompress_dir {
                self.validate_in_root(dir)?;
            }

            let cached = cache
                .get_or_download(&resource.url, &dest, downloader)
                .await?;
            self.materialize(&resource.name, &cached, &dest)?;

            let final_path = match decompress_dir {
                Some(dir) => {
                    self.decompress(resource, &cached, &dir, &mut build).await?;
                    dir
                }
                None => dest,
            };
            build.files.insert(resource.name.clone(), final_path);
        }
        Ok(build)
    }

    /// Unmount recorded zip mounts and reclaim the session's created
    /// paths. Files still referenced by the shared cache are left alone;
    /// a sibling session may need them.
    pub async fn clean_up(&self, build: &ProvisionedBuild, cache: &ResourceCache) {
        for mount in &build.zip_mounts {
            unmount_zip(mount).await;
        }
        for path in self.session.drain_created() {
            if cache.contains_path(&path) {
                continue;
            }
            if let Err(err) = recursive_delete(&path) {
                warn!("failed to delete {}: {err}", path.display());
            }
        }
    }

    fn validate_in_root(&self, path: &Path) -> Result<(), RetrievalError> {
        if !is_contained_in(path, &self.root_dir) {
            return Err(RetrievalError::OutsideWorkDir {
                path: path.to_path_buf(),
                root: self.root_dir.clone(),
            });
        }
        Ok(())
    }

    /// Ensure the resource exists at its declared destination. When the
    /// cache hit lives elsewhere, hard link it into place.
    fn materialize(&self, name: &str, cached: &Path, dest: &Path) -> Result<(), RetrievalError> {
        if cached == dest {
            self.session.track_created(dest.to_path_buf());
            return Ok(());
        }
        if !self.session.claim(format!("file:{}", dest.display())) {
            return Ok(());
        }
        if dest.exists() {
            warn!("Overwrite {name}.");
            recursive_delete(dest)?;
        } else {
            info!("Create {name}.");
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        hardlink_or_copy(cached, dest)?;
        self.session.track_created(dest.to_path_buf());
        Ok(())
    }

    /// Unpack into the target directory, once per (url, target) across
    /// the session; later requests reuse the first extraction.
    async fn decompress(
        &self,
        resource: &TestResource,
        archive: &Path,
        dir: &Path,
        build: &mut ProvisionedBuild,
    ) -> Result<(), RetrievalError> {
        let claim = format!("unpack:{}:{}", resource.url, dir.display());
        if !self.session.claim(claim) {
            return Ok(());
        }
        if let Some(mount) = self.unpacker.unpack(archive, dir).await? {
            build.zip_mounts.push(mount);
        }
        if dir != self.root_dir {
            self.session.track_created(dir.to_path_buf());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalFileDownloader;
    use crate::unpack::ExtractUnpacker;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    struct Fixture {
        _keep: tempfile::TempDir,
        root: PathBuf,
        zip_url: String,
        session: Arc<SessionResources>,
        cache: ResourceCache,
    }

    impl Fixture {
        fn new() -> Self {
            let keep = tempfile::tempdir().unwrap();
            let root = keep.path().join("root");
            let zip_path = keep.path().join("source/suite.zip");
            std::fs::create_dir_all(zip_path.parent().unwrap()).unwrap();
            write_zip(&zip_path, &[("resource.txt", b"content")]);
            Self {
                root,
                zip_url: format!("file://{}", zip_path.display()),
                session: Arc::new(SessionResources::new()),
                cache: ResourceCache::new(),
                _keep: keep,
            }
        }

        fn provider(&self, resources: Vec<TestResource>) -> ResourceProvider {
            ResourceProvider::new(
                self.root.clone(),
                resources,
                "0".into(),
                "stub".into(),
                Arc::clone(&self.session),
                Arc::new(ExtractUnpacker),
            )
        }
    }

    #[tokio::test]
    async fn same_url_twice_downloads_once_and_links_second_copy() {
        let fx = Fixture::new();
        let provider = fx.provider(vec![
            TestResource::new("copy_a.zip", &fx.zip_url, false, ""),
            TestResource::new("copy_b.zip", &fx.zip_url, false, ""),
        ]);
        let build = provider
            .fetch_build(&fx.cache, &LocalFileDownloader)
            .await
            .unwrap();

        assert_eq!(build.files.len(), 2);
        assert!(fx.root.join("copy_a.zip").is_file());
        assert!(fx.root.join("copy_b.zip").is_file());
        // One cache entry backs both.
        assert!(fx.cache.cached_path(&fx.zip_url).is_some());
    }

    #[tokio::test]
    async fn decompresses_into_separate_directories() {
        let fx = Fixture::new();
        let provider = fx.provider(vec![
            TestResource::new("res_a", &fx.zip_url, true, "dir1"),
            TestResource::new("res_b", &fx.zip_url, true, "dir2"),
        ]);
        let build = provider
            .fetch_build(&fx.cache, &LocalFileDownloader)
            .await
            .unwrap();

        assert!(fx.root.join("dir1/resource.txt").is_file());
        assert!(fx.root.join("dir2/resource.txt").is_file());
        assert_eq!(build.files["res_a"], fx.root.join("dir1"));
        assert_eq!(build.files["res_b"], fx.root.join("dir2"));
    }

    #[tokio::test]
    async fn identical_url_and_target_extract_once() {
        let fx = Fixture::new();
        let provider = fx.provider(vec![
            TestResource::new("res_a", &fx.zip_url, true, "shared"),
            TestResource::new("res_b", &fx.zip_url, true, "shared"),
        ]);
        provider
            .fetch_build(&fx.cache, &LocalFileDownloader)
            .await
            .unwrap();

        assert!(fx.root.join("shared/resource.txt").is_file());
        // The session holds a single unpack claim for the pair.
        let claims = fx.session.claims.lock().unwrap();
        assert_eq!(
            claims
                .iter()
                .filter(|key| key.starts_with("unpack:"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn traversal_decompress_dir_is_rejected() {
        let fx = Fixture::new();
        let provider = fx.provider(vec![TestResource::new("res", &fx.zip_url, true, "../out")]);
        let err = provider
            .fetch_build(&fx.cache, &LocalFileDownloader)
            .await
            .unwrap_err();

        assert!(matches!(err, RetrievalError::OutsideWorkDir { .. }));
        assert!(!fx._keep.path().join("out").exists());
    }

    #[tokio::test]
    async fn traversal_resource_name_is_rejected() {
        let fx = Fixture::new();
        let provider = fx.provider(vec![TestResource::new("../res", &fx.zip_url, false, "")]);
        let err = provider
            .fetch_build(&fx.cache, &LocalFileDownloader)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::OutsideWorkDir { .. }));
    }

    #[tokio::test]
    async fn cleanup_spares_live_cache_entries() {
        let keep = tempfile::tempdir().unwrap();
        let source = keep.path().join("suite.zip");
        write_zip(&source, &[("resource.txt", b"content")]);
        let url = format!("file://{}", source.display());
        let cache = ResourceCache::new();

        // Session one downloads into its root; the download destination
        // becomes the shared cache entry.
        let root_one = keep.path().join("one");
        let session_one = Arc::new(SessionResources::new());
        let provider_one = ResourceProvider::new(
            root_one.clone(),
            vec![TestResource::new("suite.zip", &url, false, "")],
            "0".into(),
            "stub".into(),
            Arc::clone(&session_one),
            Arc::new(ExtractUnpacker),
        );
        let build_one = provider_one
            .fetch_build(&cache, &LocalFileDownloader)
            .await
            .unwrap();

        // Session two links the cached file and decompresses it.
        let root_two = keep.path().join("two");
        let session_two = Arc::new(SessionResources::new());
        let provider_two = ResourceProvider::new(
            root_two.clone(),
            vec![TestResource::new("suite.zip", &url, true, "suite")],
            "0".into(),
            "stub".into(),
            Arc::clone(&session_two),
            Arc::new(ExtractUnpacker),
        );
        let build_two = provider_two
            .fetch_build(&cache, &LocalFileDownloader)
            .await
            .unwrap();
        assert!(root_two.join("suite/resource.txt").is_file());

        // Session two cleans up: its link and extraction go away, but the
        // cache entry under session one's root survives.
        provider_two.clean_up(&build_two, &cache).await;
        assert!(!root_two.join("suite").exists());
        assert!(!root_two.join("suite.zip").exists());
        assert!(root_one.join("suite.zip").is_file());

        // Session one cleans up last; only then does its entry get
        // removed by its own teardown (the cache still claims it).
        provider_one.clean_up(&build_one, &cache).await;
        assert!(root_one.join("suite.zip").is_file());
        cache.clear();
    }

    #[tokio::test]
    async fn created_paths_are_tracked_per_session() {
        let fx = Fixture::new();
        let provider = fx.provider(vec![TestResource::new("res", &fx.zip_url, true, "dir1")]);
        provider
            .fetch_build(&fx.cache, &LocalFileDownloader)
            .await
            .unwrap();
        let created = fx.session.created_paths();
        assert!(created.contains(&fx.root.join("res")));
        assert!(created.contains(&fx.root.join("dir1")));
    }
}
