use brief_core::ArtifactKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Nothing was ever written for this kind. Only expected before the first
    /// successful refresh.
    #[error("no {0} artifact has been stored yet")]
    NotFound(ArtifactKind),

    /// The medium could not be read or written (or held corrupt data).
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
