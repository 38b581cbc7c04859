use thiserror::Error;

use crate::ContentHash;

/// The closed set of error categories a blob store can report.
///
/// Callers that need to branch on a failure should match on the kind rather
/// than on the exact variant, as the variants carry backend-specific context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidHash,
    HashMismatch,
    TransientIo,
    Cancelled,
    CleanupFailed,
    InvalidArgument,
    Configuration,
    Other,
}

/// An error type for the blob-store crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no blob exists for hash `{hash}`")]
    NotFound { hash: ContentHash },
    #[error("invalid hash `{hash}`: {reason}")]
    InvalidHash { hash: String, reason: String },
    #[error("the content written for `{expected}` actually hashes to `{actual}`")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("the operation was cancelled")]
    Cancelled,
    #[error("the operation deadline was exceeded")]
    DeadlineExceeded,
    #[error("{source} (cleanup also failed: {cleanup})")]
    CleanupFailed {
        #[source]
        source: Box<Error>,
        cleanup: anyhow::Error,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(hash: ContentHash) -> Self {
        Self::NotFound { hash }
    }

    pub fn invalid_hash(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHash {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    pub fn hash_mismatch(expected: ContentHash, actual: ContentHash) -> Self {
        Self::HashMismatch { expected, actual }
    }

    pub fn io(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Io {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Attach the failure of a rollback step to the error that triggered it.
    pub fn cleanup_failed(self, cleanup: impl Into<anyhow::Error>) -> Self {
        Self::CleanupFailed {
            source: Box::new(self),
            cleanup: cleanup.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidHash { .. } => ErrorKind::InvalidHash,
            Self::HashMismatch { .. } => ErrorKind::HashMismatch,
            Self::Io { .. } => ErrorKind::TransientIo,
            Self::Cancelled | Self::DeadlineExceeded => ErrorKind::Cancelled,
            Self::CleanupFailed { .. } => ErrorKind::CleanupFailed,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Unknown(_) => ErrorKind::Other,
        }
    }

    /// Returns the kind of the error that started the failure, looking
    /// through any rollback failures stacked on top of it.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            Self::CleanupFailed { source, .. } => source.root_kind(),
            err => err.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_cancelled(&self) -> bool {
        self.root_kind() == ErrorKind::Cancelled
    }
}

pub trait MapIoError<T> {
    fn map_io_err(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> MapIoError<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn map_io_err(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::io(context, e))
    }
}

/// A result type that can be used to indicate errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;
