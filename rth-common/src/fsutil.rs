//! Filesystem helpers shared by the provider and launcher.

use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem. `..` at the root is dropped, matching how the
/// sandbox check must treat `/root/../../x`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(Component::ParentDir),
            },
            other => out.push(other),
        }
    }
    out
}

/// True when `path` resolves to `root` or a descendant of it.
///
/// This is the sandbox gate for resource destinations: a relative
/// `decompress_dir` of `"../out"` fails it.
pub fn is_contained_in(path: &Path, root: &Path) -> bool {
    normalize(path).starts_with(normalize(root))
}

/// Hard link `src` to `dst`, falling back to a copy when the link fails
/// (for example across filesystems).
pub fn hardlink_or_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    if std::fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst).map(|_| ())
}

/// Delete a file or directory tree, tolerating paths that are already gone.
pub fn recursive_delete(path: &Path) -> std::io::Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Create a uniquely named directory under the system temp dir.
pub fn unique_temp_dir(prefix: &str) -> std::io::Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
