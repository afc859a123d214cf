use thiserror::Error;

/// Errors returned from the public engine API.
///
/// Graph problems discovered during planning (cycles, undefined references)
/// are *not* surfaced here — per the error taxonomy they become a single
/// `system/error` issue in the run result so that frontends always get an
/// `ExecutionResult` back. These variants are reserved for caller mistakes.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no checks configured")]
    NoChecks,
    #[error("requested check '{0}' is not configured")]
    UnknownRequestedCheck(String),
}
