//! Archive unpacking strategies for build resources.
//!
//! Zip resources can either be extracted in place or, when the host has
//! fuse-zip available, mounted read-only with a symlink shadow tree built
//! into the destination (so a test can still create its own files next to
//! the archive content). Which strategy applies is capability-detected at
//! provider construction, not guessed per call.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use walkdir::WalkDir;

use rth_common::RetrievalError;
use rth_common::fsutil::{recursive_delete, unique_temp_dir};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 2] = [b'P', b'K'];

/// Unpacks one archive into a destination directory.
#[async_trait]
pub trait Unpacker: Send + Sync {
    /// Returns the mount point when the archive was mounted instead of
    /// extracted; the caller is responsible for unmounting it at cleanup.
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<Option<PathBuf>, RetrievalError>;
}

/// Pick the unpacker for this invocation. Mounting is used only when
/// requested and the host actually supports it.
pub fn detect_unpacker(mount_zip: bool) -> Arc<dyn Unpacker> {
    if mount_zip {
        if can_mount_zip() {
            return Arc::new(MountUnpacker);
        }
        warn!("Mounting zip requested but not supported; falling back to extracting");
    }
    Arc::new(ExtractUnpacker)
}

/// True when the fuse-zip toolchain is present on this host.
pub fn can_mount_zip() -> bool {
    which::which("fuse-zip").is_ok() && which::which("fusermount").is_ok()
}

fn is_gzip(archive: &Path) -> std::io::Result<bool> {
    Ok(read_magic(archive)? == GZIP_MAGIC)
}

fn is_zip(archive: &Path) -> std::io::Result<bool> {
    Ok(read_magic(archive)? == ZIP_MAGIC)
}

fn read_magic(archive: &Path) -> std::io::Result<[u8; 2]> {
    let mut file = std::fs::File::open(archive)?;
    let mut magic = [0u8; 2];
    // Short files are simply not archives.
    let n = file.read(&mut magic)?;
    if n < 2 {
        magic = [0, 0];
    }
    Ok(magic)
}

fn unpack_err(archive: &Path, source: std::io::Error) -> RetrievalError {
    RetrievalError::Unpack {
        archive: archive.to_path_buf(),
        source,
    }
}

/// Full in-place extraction: gzipped tarballs via flate2 + tar, zips via
/// the zip crate.
pub struct ExtractUnpacker;

impl ExtractUnpacker {
    fn extract_sync(archive: &Path, dest: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dest)?;
        if is_gzip(archive)? {
            let file = std::fs::File::open(archive)?;
            let tar = flate2::read::GzDecoder::new(file);
            tar::Archive::new(tar).unpack(dest)?;
            return Ok(());
        }
        let file = std::fs::File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file).map_err(std::io::Error::other)?;
        zip.extract(dest).map_err(std::io::Error::other)
    }
}

#[async_trait]
impl Unpacker for ExtractUnpacker {
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<Option<PathBuf>, RetrievalError> {
        info!("Extracting {} to {}...", archive.display(), dest.display());
        let archive_buf = archive.to_path_buf();
        let dest_buf = dest.to_path_buf();
        tokio::task::spawn_blocking(move || Self::extract_sync(&archive_buf, &dest_buf))
            .await
            .map_err(|err| unpack_err(archive, std::io::Error::other(err)))?
            .map_err(|err| unpack_err(archive, err))?;
        Ok(None)
    }
}

/// Mounts zips with fuse-zip and shadows the mount into the destination
/// with symlinks. Non-zip archives fall back to extraction.
pub struct MountUnpacker;

impl MountUnpacker {
    async fn mount_zip(archive: &Path, mount_dir: &Path) -> std::io::Result<()> {
        let status = tokio::process::Command::new("fuse-zip")
            .arg("-r")
            .arg(archive)
            .arg(mount_dir)
            .status()
            .await?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "fuse-zip exited with {status}"
            )));
        }
        Ok(())
    }

    /// Recreate `src`'s directory structure under `dest`, symlinking every
    /// file, so the mount content appears in place while staying writable
    /// around it.
    fn shadow_symlink(src: &Path, dest: &Path) -> std::io::Result<()> {
        for entry in WalkDir::new(src).min_depth(1) {
            let entry = entry.map_err(std::io::Error::other)?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(std::io::Error::other)?;
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                match symlink_file(entry.path(), &target) {
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                    other => other?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn symlink_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn symlink_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    // Mounting is a unix-only capability; this path is unreachable there.
    std::fs::copy(src, dst).map(|_| ())
}

#[async_trait]
impl Unpacker for MountUnpacker {
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<Option<PathBuf>, RetrievalError> {
        let zip = is_zip(archive).map_err(|err| unpack_err(archive, err))?;
        if !zip {
            return ExtractUnpacker.unpack(archive, dest).await;
        }
        std::fs::create_dir_all(dest).map_err(|err| unpack_err(archive, err))?;
        let mount_dir =
            unique_temp_dir("rth-zip-mount").map_err(|err| unpack_err(archive, err))?;
        info!("Mounting {} to {}...", archive.display(), mount_dir.display());
        Self::mount_zip(archive, &mount_dir)
            .await
            .map_err(|err| unpack_err(archive, err))?;
        info!(
            "Recursive symlink zip mount {} to {}...",
            mount_dir.display(),
            dest.display()
        );
        Self::shadow_symlink(&mount_dir, dest).map_err(|err| unpack_err(archive, err))?;
        Ok(Some(mount_dir))
    }
}

/// Unmount a fuse-zip mount point and remove the directory.
pub async fn unmount_zip(mount_dir: &Path) {
    let status = tokio::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_dir)
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("fusermount -u {} exited with {status}", mount_dir.display()),
        Err(err) => warn!("failed to unmount {}: {err}", mount_dir.display()),
    }
    if let Err(err) = recursive_delete(mount_dir) {
        warn!("failed to remove mount dir {}: {err}", mount_dir.display());
    }
}
