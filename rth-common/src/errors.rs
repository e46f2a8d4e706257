//! Error taxonomy for the harness.
//!
//! Three families, matching how failures propagate:
//! - [`ConfigError`]: wrong setup, fatal before any work starts.
//! - [`RetrievalError`]: resource provisioning failed, fatal to the build
//!   attempt; retry policy belongs to the caller.
//! - [`LaunchError`]: the launcher could not run or was interrupted.
//!   Per-test-case subprocess failures are NOT errors; they are reported
//!   through the listener and the batch continues.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration and setup errors. Fail fast, before running any test.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid test filter pattern {pattern:?}: {source}")]
    BadFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("player CLI {} not found", .0.display())]
    PlayerNotFound(PathBuf),

    #[error("test input {} not found", .0.display())]
    TestInputNotFound(PathBuf),

    #[error("previous results {} unreadable: {reason}", .path.display())]
    BadPreviousResults { path: PathBuf, reason: String },
}

/// Resource retrieval errors. Fatal to the specific build attempt.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("resource {0} has an empty url")]
    EmptyUrl(String),

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("{} is outside of working directory {}", .path.display(), .root.display())]
    OutsideWorkDir { path: PathBuf, root: PathBuf },

    #[error("failed to unpack {}: {source}", .archive.display())]
    Unpack {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resource i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Launcher-level errors. `Interrupted` is distinguishable so the outer
/// scheduler can tell harness shutdown from test failure.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to prepare work dir {}: {source}", .path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invocation interrupted")]
    Interrupted,
}

/// Top-level error for harness entry points.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl HarnessError {
    /// True when the error is the cancellation signal unwinding, not a
    /// genuine failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Launch(LaunchError::Interrupted))
    }
}
