use thiserror::Error;

/// Errors produced by journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("entry session '{actual}' does not match journal session '{expected}'")]
    SessionMismatch { expected: String, actual: String },
}
