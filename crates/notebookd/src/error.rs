//! Error taxonomy shared by every layer of the engine.
//!
//! Variants are structured so a caller can branch on the kind without
//! parsing the message. Validation failures (NotFound, IndexOutOfRange,
//! AlreadyExists, NotACodeCell) are never worth retrying; TimedOut and
//! SessionBusy are recoverable; a Dead kernel session is never reused.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NotebookError>;

#[derive(Debug, Error)]
pub enum NotebookError {
    #[error("notebook not found: {0}")]
    NotFound(PathBuf),

    #[error("path already exists: {0} (use overwrite to replace)")]
    AlreadyExists(PathBuf),

    #[error("malformed notebook {path}: {detail}")]
    MalformedDocument { path: PathBuf, detail: String },

    #[error("nothing to back up: {0} has never been persisted")]
    SourceMissing(PathBuf),

    #[error("cell index {index} out of range (valid 0..{len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("cell {index} is a {kind} cell, not a code cell")]
    NotACodeCell { index: usize, kind: String },

    #[error("kernel backend '{spec}' unavailable: {detail}")]
    BackendUnavailable { spec: String, detail: String },

    #[error("kernel session '{0}' is busy with another submission")]
    SessionBusy(String),

    #[error("execution timed out after {0:?}; interrupt sent to kernel")]
    TimedOut(Duration),

    #[error("kernel was restarted while the submission was pending")]
    KernelRestarted,

    #[error("failed to read {path}: {detail}")]
    ReadFailed { path: PathBuf, detail: String },

    #[error("failed to write {path}: {detail}")]
    WriteFailed { path: PathBuf, detail: String },

    #[error("execution failed: {ename}: {evalue}")]
    ExecutionFailed { ename: String, evalue: String },
}

impl NotebookError {
    /// Stable machine-readable kind, used in CLI/RPC payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            NotebookError::NotFound(_) => "not_found",
            NotebookError::AlreadyExists(_) => "already_exists",
            NotebookError::MalformedDocument { .. } => "malformed_document",
            NotebookError::SourceMissing(_) => "source_missing",
            NotebookError::IndexOutOfRange { .. } => "index_out_of_range",
            NotebookError::NotACodeCell { .. } => "not_a_code_cell",
            NotebookError::BackendUnavailable { .. } => "backend_unavailable",
            NotebookError::SessionBusy(_) => "session_busy",
            NotebookError::TimedOut(_) => "timed_out",
            NotebookError::KernelRestarted => "kernel_restarted",
            NotebookError::ReadFailed { .. } => "read_failed",
            NotebookError::WriteFailed { .. } => "write_failed",
            NotebookError::ExecutionFailed { .. } => "execution_failed",
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind(),
            "detail": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        let err = NotebookError::IndexOutOfRange { index: 7, len: 3 };
        assert_eq!(err.kind(), "index_out_of_range");
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn test_read_and_write_failures_are_distinct_kinds() {
        let read = NotebookError::ReadFailed {
            path: PathBuf::from("/tmp/dir"),
            detail: "permission denied".to_string(),
        };
        let write = NotebookError::WriteFailed {
            path: PathBuf::from("/tmp/nb.ipynb"),
            detail: "disk full".to_string(),
        };
        assert_eq!(read.kind(), "read_failed");
        assert_eq!(write.kind(), "write_failed");
    }

    #[test]
    fn test_payload_shape() {
        let err = NotebookError::NotFound(PathBuf::from("/tmp/missing.ipynb"));
        let payload = err.to_payload();
        assert_eq!(payload["error"], "not_found");
        assert!(payload["detail"].as_str().unwrap().contains("missing.ipynb"));
    }
}
