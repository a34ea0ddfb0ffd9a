use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum MirrorError {
    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("corrupt dump at offset {offset}: {message}")]
    #[diagnostic(help("the compressed stream is truncated or fails its checksum"))]
    CorruptDump { offset: u64, message: String },

    #[error("malformed dump record at offset {offset}: {message}")]
    Format { offset: u64, message: String },

    #[error("failed to decode record: {0}")]
    Decode(String),

    #[error("storage I/O failed: {0}")]
    StorageIo(String),

    #[error("storage constraint violated: {0}")]
    #[diagnostic(help("upserts are keyed by id; a constraint failure indicates a bug"))]
    Constraint(String),

    #[error("import aborted at offset {offset}: {failed} of {records} records in batch failed to decode")]
    #[diagnostic(help(
        "the dump format may have changed; the store and checkpoint are left at the last committed batch"
    ))]
    ImportAborted {
        offset: u64,
        failed: usize,
        records: usize,
    },

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream returned status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("checkpoint does not match dump: {0}")]
    #[diagnostic(help("run the import with --restart to re-import from the beginning"))]
    CheckpointMismatch(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl MirrorError {
    /// Errors worth retrying the same storage batch for.
    pub fn is_retryable_storage(&self) -> bool {
        matches!(self, MirrorError::StorageIo(_))
    }
}

impl From<rusqlite::Error> for MirrorError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                MirrorError::Constraint(err.to_string())
            }
            _ => MirrorError::StorageIo(err.to_string()),
        }
    }
}
