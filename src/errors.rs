use std::path::PathBuf;

use crate::document::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("No document is open")]
    NotOpened,

    #[error("File missing: {0}")]
    FileMissing(PathBuf),

    #[error("File is not writable: {0}")]
    NotWritable(PathBuf),

    #[error("Unknown document type: {0}")]
    UnknownDocType(PathBuf),

    #[error("Backend not compiled in: {0}")]
    BackendUnavailable(&'static str),

    #[error("Wrong password for {0}")]
    WrongPassword(PathBuf),

    #[error("Not a valid archive: {0}")]
    BadArchive(PathBuf),

    #[error("Archiving failed with status {status}: {path}")]
    ArchiveFailed { path: PathBuf, status: i32 },

    #[error("Integrity check failed for {path}: {reason}. Use \"Save As\" to write a fresh copy")]
    IntegrityCheck { path: PathBuf, reason: String },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Save failed: {0}")]
    SaveFailed(String),

    #[error("Load failed: {0}")]
    LoadFailed(String),

    #[error("Backend error: {0:#}")]
    Backend(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backends return `anyhow` errors; a `StorageError` raised inside a backend is
/// recovered as-is instead of being wrapped.
impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StorageError>() {
            Ok(inner) => inner,
            Err(err) => StorageError::Backend(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_their_kind() {
        let err: anyhow::Error = StorageError::FileMissing(PathBuf::from("a.ctb")).into();
        assert!(matches!(StorageError::from(err), StorageError::FileMissing(_)));

        let err = StorageError::from(anyhow::anyhow!("boom"));
        assert!(matches!(err, StorageError::Backend(_)));
        assert_eq!(err.to_string(), "Backend error: boom");
    }
}
