use thiserror::Error;

/// Storage failure kinds surfaced by [`crate::Db`].
#[derive(Debug, Error)]
pub enum DbError {
    /// The requested entity is absent.
    #[error("not found")]
    NotFound,
    /// A write raced with a conflicting one. The engine itself never
    /// produces this today; higher layers use it for duplicate-creation
    /// races (e.g. two censuses claiming the same identifier).
    #[error("conflict: {0}")]
    Conflict(String),
    /// An engine or filesystem failure.
    #[error("io: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for DbError {
    fn from(e: rocksdb::Error) -> Self {
        DbError::Io(e.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e.to_string())
    }
}
