//! Unified error types for the burrow workspace.
//!
//! Every fallible library operation returns [`Result`]. Kernel calls are
//! reported through [`BurrowError::Syscall`] so the diagnostic always names
//! the operation that failed.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// An I/O operation on a path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A kernel operation (mount, unshare, setns, ioctl, ...) failed.
    #[error("{op}: {source}")]
    Syscall {
        /// Human-readable name of the failed operation, e.g. `mount(/dev)`.
        op: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The kernel rejected or failed to answer a routing-socket request.
    #[error("netlink: {message}")]
    Netlink {
        /// Description of the failure.
        message: String,
    },

    /// The privilege helper process failed.
    #[error("privilege helper failed: {message}")]
    Helper {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BurrowError {
    /// Builds a [`BurrowError::Syscall`] from anything convertible into an
    /// [`std::io::Error`] (an `nix` errno, a raw OS error, ...).
    pub fn syscall(op: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Syscall {
            op: op.into(),
            source: source.into(),
        }
    }

    /// Builds a [`BurrowError::Syscall`] from the calling thread's `errno`.
    pub fn last_os_error(op: impl Into<String>) -> Self {
        Self::syscall(op, std::io::Error::last_os_error())
    }

    /// Builds a [`BurrowError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BurrowError>;
