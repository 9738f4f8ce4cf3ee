use thiserror::Error;

/// POSIX-flavored error taxonomy of the namespace layer. The protocol
/// binding above us maps these kinds to literal errno values.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store failed schema validation or the cache could not be rebuilt
    /// into a connected tree. Fatal to mounting; never silently downgraded.
    #[error("corrupted or incompatible store: {0}")]
    Corrupted(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        FsError::InvalidArgument(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        FsError::Corrupted(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        FsError::Internal(msg.into())
    }
}

pub type FsResult<T> = Result<T, FsError>;
