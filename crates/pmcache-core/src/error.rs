//! Error types for pmcache operations
//!
//! Two layers: [`PoolError`] for the persistent pool and its transactions,
//! and [`EngineError`] for the item cache built on top of it. Engine errors
//! map one-to-one onto the result classes a host sees (not found, exists,
//! not stored, out of memory, not supported, invalid, fatal).

use std::path::PathBuf;

use thiserror::Error;

/// Persistent pool error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// I/O operation on the pool file failed
    #[error("I/O error{}: {message} ({kind})", fmt_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Superblock magic did not match; the file is not a pool
    #[error("Not a pmcache pool: {} has magic {found:02x?}", .path.display())]
    BadMagic {
        /// Pool file path
        path: PathBuf,
        /// Bytes found where the magic was expected
        found: [u8; 8],
    },

    /// Pool was written by an incompatible format version
    #[error("Pool version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        expected: u32,
        found: u32,
    },

    /// Pool was created for a different layout name
    #[error("Pool layout mismatch: expected {expected:?}, found {found:?}")]
    LayoutMismatch {
        expected: String,
        found: String,
    },

    /// Requested pool size cannot hold the superblock, log and a minimal heap
    #[error("Pool size {requested} bytes is below the minimum of {minimum} bytes")]
    PoolTooSmall {
        requested: u64,
        minimum: u64,
    },

    /// Heap exhausted
    #[error("Pool out of space: requested {requested} bytes, {available} bytes left")]
    OutOfSpace {
        /// Block size that was requested (including header)
        requested: u64,
        /// Unused bytes between the heap top and the end of the pool
        available: u64,
    },

    /// Undo log cannot hold another snapshot in this transaction
    #[error("Undo log full: need {needed} bytes, capacity {capacity} bytes")]
    LogFull {
        needed: u64,
        capacity: u64,
    },

    /// Offset or range outside the mapped pool, or not a live block
    #[error("Invalid pool offset {offset} (len {len})")]
    InvalidOffset {
        offset: u64,
        len: u64,
    },

    /// A heap block header is not plausible
    #[error("Heap corrupted at offset {offset}: {reason}")]
    CorruptHeap {
        offset: u64,
        reason: String,
    },

    /// An undo record failed verification during rollback
    #[error("Undo log corrupted at offset {offset}: {reason}")]
    CorruptLog {
        /// Byte offset of the bad record inside the pool
        offset: u64,
        /// Description of the corruption
        reason: String,
    },
}

fn fmt_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

/// Convert std::io::Error to PoolError::Io
impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Item cache error types
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Key absent (or expired) on get/cas/delete
    #[error("No such key")]
    KeyNotFound,

    /// CAS token mismatch, a lost race rather than a missing key
    #[error("Key exists with a different CAS token")]
    KeyExists,

    /// Store precondition not met (add on existing, replace on missing, ...)
    #[error("Item not stored")]
    NotStored,

    /// The pool could not satisfy an item allocation
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// Total record size that was requested
        requested: u64,
    },

    /// Operation this engine does not implement
    #[error("Operation not supported: {operation}")]
    NotSupported {
        operation: &'static str,
    },

    /// Caller broke an operation precondition
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        reason: String,
    },

    /// A structural transaction aborted; the engine refuses further writes
    #[error("Engine unavailable: {reason}")]
    Fatal {
        reason: String,
    },

    /// Pool failure outside a structural transaction (open, sweep, I/O)
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl EngineError {
    /// True for errors after which the engine must be reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal { .. })
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        EngineError::InvalidArgument { reason: reason.into() }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
