//! Error types shared by every component of the engine.

use std::path::PathBuf;

/// Errors produced by the twoskip engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O failure (open, read, write, fsync, rename, ...).
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path the operation was performed against.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The file's first 20 bytes do not match the twoskip magic.
    #[error("invalid magic header in {0}")]
    InvalidMagic(PathBuf),

    /// The header declares a format version newer than this build understands.
    #[error("unsupported format version {found} (max supported {max}) in {path}")]
    UnsupportedVersion {
        /// Path of the offending file.
        path: PathBuf,
        /// Version found on disk.
        found: u32,
        /// Highest version this build knows how to read.
        max: u32,
    },

    /// The 64-byte header failed its own CRC check.
    #[error("header CRC mismatch in {0}")]
    CorruptHeader(PathBuf),

    /// A record failed a head or tail CRC check, or its lengths don't fit the file.
    #[error("corrupt record at offset {offset} in {path}: {reason}")]
    CorruptRecord {
        /// Path of the offending file.
        path: PathBuf,
        /// Byte offset of the record.
        offset: u64,
        /// Human-readable description.
        reason: String,
    },

    /// Key not present (fetch, fetchnext past end, or empty file during rebuild).
    #[error("key not found")]
    NotFound,

    /// Key already present on a non-forcing store.
    #[error("key already exists")]
    Exists,

    /// A consistency check detected a structural violation.
    #[error("internal consistency violation in {path}: {reason}")]
    Internal {
        /// Path of the offending file.
        path: PathBuf,
        /// Human-readable description.
        reason: String,
    },

    /// Failed to acquire (or release) an advisory file lock.
    #[error("lock error on {path}: {reason}")]
    Lock {
        /// Path of the offending file.
        path: PathBuf,
        /// Human-readable description.
        reason: String,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt_record(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptRecord {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Internal {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn lock(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Lock {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors where the database file itself is in question and a
    /// subsequent lock acquisition should trigger recovery.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Error::Io { .. }
                | Error::InvalidMagic(_)
                | Error::UnsupportedVersion { .. }
                | Error::CorruptHeader(_)
                | Error::CorruptRecord { .. }
        )
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;
