use thiserror::Error;

use vellum_labels::Operation;

use crate::ObjRef;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("operation {op} not permitted{}", .objref.map(|r| format!(" for object {}", r)).unwrap_or_default())]
    PermissionDenied { op: Operation, objref: Option<ObjRef> },
    #[error("concurrent modification: {detail}")]
    ConcurrentModification { detail: String, transient: bool },
    #[error("object {0} not found")]
    NotFound(ObjRef),
    #[error("object {0} already exists")]
    DuplicateId(ObjRef),
    #[error("malformed query: {0}")]
    MalformedQuery(String),
    #[error("indexing failure: {0}")]
    IndexingFailure(String),
    #[error("invalid object: {0}")]
    InvalidObject(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn denied(op: Operation, objref: Option<ObjRef>) -> Self {
        StoreError::PermissionDenied { op, objref }
    }

    /// Version or parent path mismatch. Not retried.
    pub fn conflict(detail: impl Into<String>) -> Self {
        StoreError::ConcurrentModification { detail: detail.into(), transient: false }
    }

    /// Transient backend failures which a serializable transaction retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::ConcurrentModification { transient: true, .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::ConcurrentModification { detail: e.to_string(), transient: true }
            }
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("serialization: {}", e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::Backend("connection lock poisoned".to_string())
    }
}
