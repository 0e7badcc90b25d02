//! Error types for the data layer.
//!
//! Every I/O call returns one of these. Components decide at their own
//! boundary whether an error is surfaced to the caller or contained (logged and
//! replaced by a fallback such as an empty slice or a cache miss).

use thiserror::Error;

/// Failure of the durable key-value backend.
#[derive(Debug, Error)]
pub enum StorageError {
  /// SQLite returned an error.
  #[error("sqlite error during {operation}: {source}")]
  Sqlite {
    operation: &'static str,
    #[source]
    source: rusqlite::Error,
  },

  /// Filesystem error outside the database (directories, backup files).
  #[error("failed to {operation} {path}: {source}")]
  Io {
    operation: &'static str,
    path: String,
    #[source]
    source: std::io::Error,
  },

  /// A backend mutex was poisoned by a panicking writer.
  #[error("storage lock poisoned")]
  LockPoisoned,

  /// The blocking task running the operation was cancelled or panicked.
  #[error("storage task failed: {0}")]
  Task(String),

  /// Injected or backend-specific failure without a richer cause.
  #[error("storage unavailable: {0}")]
  Unavailable(String),
}

/// A decoded document does not have the shape its slice requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
  /// The bytes are not valid JSON for the expected type.
  #[error("malformed document: {0}")]
  Decode(String),

  /// The top-level value is not a JSON object.
  #[error("expected an object at the top level")]
  NotAnObject,

  /// A required member is missing or has the wrong JSON type.
  #[error("member `{member}` must be {expected}")]
  Member {
    member: &'static str,
    expected: &'static str,
  },
}

/// Errors surfaced by [`PersistentStore`](crate::store::PersistentStore) and the
/// other components that write through it.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The value could not be encoded. Caller error, not retried.
  #[error("failed to serialize {what}: {source}")]
  Serialization {
    what: String,
    #[source]
    source: serde_json::Error,
  },

  /// The backend failed; the operation did not happen.
  #[error("storage I/O failed: {0}")]
  StorageIo(#[from] StorageError),

  /// The stored or supplied document failed shape validation.
  #[error("corrupted {what}: {source}")]
  Corruption {
    what: String,
    #[source]
    source: ShapeError,
  },
}

impl StoreError {
  pub(crate) fn serialization(what: impl Into<String>, source: serde_json::Error) -> Self {
    Self::Serialization {
      what: what.into(),
      source,
    }
  }

  pub(crate) fn corruption(what: impl Into<String>, source: ShapeError) -> Self {
    Self::Corruption {
      what: what.into(),
      source,
    }
  }
}

/// Failure while running schema migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
  /// A step reported that it could not transform the snapshot.
  #[error("migration to version {version} failed: {reason}")]
  StepFailed { version: u32, reason: String },

  /// A step returned a snapshot that does not satisfy the slice shapes.
  #[error("migration to version {version} produced an invalid `{slice}` slice: {source}")]
  InvalidOutput {
    version: u32,
    slice: &'static str,
    #[source]
    source: ShapeError,
  },

  /// No step is registered for a version between the stored and current one.
  #[error("no migration step registered for version {0}")]
  MissingStep(u32),

  /// Reading or committing the snapshot failed.
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// A remote application attempt failed. The change stays queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  /// The remote endpoint could not be reached.
  #[error("remote unavailable: {0}")]
  Unavailable(String),

  /// The remote endpoint rejected the change.
  #[error("remote rejected change {id}: {reason}")]
  Rejected { id: u64, reason: String },
}

/// Failure while writing or restoring a backup file.
#[derive(Debug, Error)]
pub enum BackupError {
  /// The backup file could not be read or written.
  #[error(transparent)]
  Io(#[from] StorageError),

  /// The file is not a backup this release understands.
  #[error("invalid backup file: {0}")]
  Format(String),

  /// The stored checksum does not match the data.
  #[error("backup checksum mismatch: expected {expected}, got {actual}")]
  ChecksumMismatch { expected: String, actual: String },

  /// A slice inside the backup failed shape validation.
  #[error("backup slice `{slice}` is invalid: {source}")]
  InvalidSlice {
    slice: String,
    #[source]
    source: ShapeError,
  },

  /// Reading or committing slices failed.
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Result alias for store-level operations.
pub type Result<T> = std::result::Result<T, StoreError>;
