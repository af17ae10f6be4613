//! Error taxonomy shared across the crate.
//!
//! Remote-control-plane failures are classified by kind so that callers can
//! decide what is transient (worth one re-login and retry) and what is not.
//! Packet-filter command failures keep the captured diagnostic text.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Authentication against the control plane failed or the session expired.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The control plane could not be reached (connect/timeout/transport).
    #[error("connection failed: {0}")]
    Connection(String),

    /// The addressed resource does not exist on the control plane.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other control-plane failure, with the captured response body.
    #[error("control plane error: {0}")]
    Api(String),

    /// Packet-filter command invocation failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A host port/protocol pair is already claimed by an enabled rule.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The container has no discoverable address or is not running.
    #[error("unresolvable container address: {0}")]
    Unresolvable(String),

    /// Rule store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid or unloadable configuration.
    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Whether a single session refresh plus retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Auth(_) | BridgeError::Connection(_))
    }
}

/// Failure modes of a single external command invocation.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The binary is not installed or not on PATH. A configuration error.
    #[error("command '{0}' not found; ensure it is installed and on PATH")]
    BinaryMissing(String),

    /// The command did not finish within the configured deadline.
    #[error("command timed out after {0}s")]
    Timeout(u64),

    /// Non-zero exit, with the captured stderr (or stdout when stderr is empty).
    #[error("command exited with status {code}: {output}")]
    Failed { code: i32, output: String },

    /// Spawning or collecting the process failed for another reason.
    #[error("failed to run command: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for BridgeError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                BridgeError::Conflict(
                    message
                        .clone()
                        .unwrap_or_else(|| "uniqueness constraint violated".to_string()),
                )
            }
            _ => BridgeError::Storage(err.to_string()),
        }
    }
}
