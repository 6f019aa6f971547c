use std::io;

use thiserror::Error;

/// A malformed query or expression. Surfaced to the requesting client and
/// never fatal to the root.
#[derive(Debug, Clone, Error)]
#[error("failed to parse query: {0}")]
pub struct QueryParseError(pub String);

impl QueryParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum QueryExecError {
    #[error(transparent)]
    Parse(#[from] QueryParseError),

    #[error("synchronization failed: {0}")]
    Sync(#[from] CookieSyncError),

    #[error("root is poisoned: {0}")]
    Poisoned(String),

    #[error("the root has been cancelled")]
    RootCancelled,

    #[error("{0}")]
    Other(String),
}

impl QueryExecError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Failure modes of the cookie synchronization protocol.
///
/// `Aborted` means a concurrent recrawl invalidated the outstanding cookies;
/// the caller may retry the sync. `RootGone` cancels the root.
#[derive(Debug, Clone, Error)]
pub enum CookieSyncError {
    #[error("sync_to_now timed out waiting for the cookie to be observed")]
    Timeout,

    #[error("root has been removed or is inaccessible: {0}")]
    RootGone(String),

    #[error("cookie sync was aborted")]
    Aborted,

    #[error("{syscall}({path}): {message}")]
    Io {
        syscall: &'static str,
        path: String,
        kind: io::ErrorKind,
        message: String,
    },
}

impl CookieSyncError {
    pub fn io(syscall: &'static str, path: impl Into<String>, err: &io::Error) -> Self {
        Self::Io {
            syscall,
            path: path.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// True when the underlying errno indicates the cookie directory itself
    /// is gone, which triggers the fall-back-to-root retry in
    /// `Root::sync_to_now`.
    pub fn is_cookie_dir_gone(&self) -> bool {
        matches!(
            self,
            Self::Io {
                kind: io::ErrorKind::NotFound
                    | io::ErrorKind::NotADirectory
                    | io::ErrorKind::PermissionDenied,
                ..
            }
        )
    }
}

#[derive(Debug, Error)]
pub enum RootError {
    #[error("{0} does not exist or is not a directory")]
    NotADirectory(String),

    #[error("filesystem type {fs_type} for {path} is disallowed by configuration")]
    DisallowedFilesystem { path: String, fs_type: String },

    #[error("{path} contains none of the files required by root_restrict_files")]
    RestrictionFailed { path: String },

    #[error("unable to start watching {path}: {reason}")]
    WatcherTerminal { path: String, reason: String },

    #[error("root {0} has been cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A cloneable error representation for values held in caches; loader errors
/// are cached for the configured TTL and shared with every waiter.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CacheError {
    pub kind: io::ErrorKind,
    pub message: String,
}

impl From<&io::Error> for CacheError {
    fn from(err: &io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        Self::from(&err)
    }
}
