use crate::models::obj_id::ObjId;
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    ObjNotFound(ObjId),
    #[error("version {version} of object `{id}` not found")]
    VersionNotFound { id: ObjId, version: u64 },
    #[error("folder `{0}` not found")]
    FolderNotFound(String),
    #[error("object `{0}` already exists")]
    ObjExists(ObjId),
    #[error("version {version} of object `{id}` already exists")]
    VersionExists { id: ObjId, version: u64 },
    #[error("folder `{0}` already exists")]
    FolderExists(String),
    #[error("another upload transaction is open for object `{0}`")]
    ConcurrentTransaction(ObjId),
    #[error("corrupt file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("invalid diff: {0}")]
    InvalidDiff(String),
    #[error("bytes [{start}, {end}) of version {version} of `{id}` are not cached")]
    NotCached {
        id: ObjId,
        version: u64,
        start: u64,
        end: u64,
    },
    #[error("range [{start}, {end}) is outside {size} segment bytes")]
    OutOfRange { start: u64, end: u64, size: u64 },
    #[error("value {0} does not fit in 40 bits")]
    ValueTooLarge(u64),
    #[error("remote storage failure: {0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StorageError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjNotFound(_)
            | StorageError::VersionNotFound { .. }
            | StorageError::FolderNotFound(_) => true,
            StorageError::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            StorageError::ObjExists(_)
            | StorageError::VersionExists { .. }
            | StorageError::FolderExists(_) => true,
            StorageError::Io(err) => err.kind() == io::ErrorKind::AlreadyExists,
            _ => false,
        }
    }

    /// Failures worth retrying later, e.g. on the next connectivity event.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Remote(_) | StorageError::ConcurrentTransaction(_)
        )
    }
}

/// Map an `io::ErrorKind::NotFound` into `Ok(None)`.
pub(crate) fn absent_if_not_found<T>(res: io::Result<T>) -> io::Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
