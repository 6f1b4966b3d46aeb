//! Error types for widewalk
//!
//! This module defines the error hierarchy for the traversal engine:
//! - Raw OS errors carried as errno values (`Errno`)
//! - Configuration errors caught before the walk starts
//! - I/O queue channel failures
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Per-entry filesystem errors are not errors at this level: they are
//!   delivered through the visitor callback or accumulated by the engine
//! - The walk itself fails with the single most relevant errno

use std::io;
use thiserror::Error;

/// A raw OS error number.
///
/// The engine accumulates per-entry failures as errno values and surfaces
/// the most relevant one when the walk finishes. Whiteout emulation and
/// symlink retry logic also branch on specific errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// Capture the calling thread's current OS error.
    pub fn last() -> Self {
        Errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// Convert to a `std::io::Error`.
    pub fn to_io(self) -> io::Error {
        io::Error::from_raw_os_error(self.0)
    }

    /// Whether this error means "the path does not resolve".
    ///
    /// `ENOTDIR` is treated like `ENOENT`: a path component that turned out
    /// not to be a directory fails to resolve the same way a missing one
    /// does. Broken-symlink retry keys off this.
    pub fn is_not_found(self) -> bool {
        self.0 == libc::ENOENT || self.0 == libc::ENOTDIR
    }

    /// Whether this error calls for component-wise path recovery.
    pub fn is_name_too_long(self) -> bool {
        self.0 == libc::ENAMETOOLONG
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (errno {})", self.to_io(), self.0)
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Top-level error type for a traversal.
#[derive(Error, Debug)]
pub enum WalkError {
    /// Invalid configuration, reported before any callback runs
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The walk finished but accumulated a filesystem error
    #[error("traversal error: {0}")]
    Traversal(Errno),

    /// I/O queue failure
    #[error("I/O queue error: {0}")]
    Ioq(#[from] IoqError),
}

impl WalkError {
    /// The errno equivalent of this error, for exit-code style reporting.
    pub fn errno(&self) -> Errno {
        match self {
            WalkError::Config(_) => Errno(libc::EINVAL),
            WalkError::Traversal(errno) => *errno,
            WalkError::Ioq(_) => Errno(libc::EIO),
        }
    }
}

/// Configuration errors caught up front.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The open-descriptor budget cannot support a walk
    #[error("max_open {given} is too small: at least {min} descriptors are required")]
    OpenFdLimit { given: usize, min: usize },
}

/// I/O queue channel errors.
#[derive(Error, Debug, Clone)]
pub enum IoqError {
    /// All worker threads terminated while requests were outstanding
    #[error("I/O queue workers terminated unexpectedly")]
    Disconnected,
}

/// Result type alias for WalkError
pub type Result<T> = std::result::Result<T, WalkError>;
