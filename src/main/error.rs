//! The error surface of the scheduling API.

/// Why a runtime operation failed.
///
/// These are the recoverable conditions callers are expected to handle;
/// scheduler invariant violations are bugs and assert instead.
#[derive(Debug)]
pub enum RuntimeError {
    /// The configuration is contradictory or impossible to satisfy
    /// (e.g. more pinned workers than accessible CPUs).
    ConfigInvalid(String),
    /// The operation was attempted before `start_runtime` or after
    /// `terminate_runtime`.
    RuntimeStopped,
    /// A wait expired before the event it was waiting for.
    TimedOut,
    /// The operation was abandoned because the fiber or runtime is being
    /// torn down.
    Cancelled,
    /// A fiber stack could not be allocated; the fiber was not started.
    AllocationFailed,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::ConfigInvalid(why) => write!(f, "invalid configuration: {why}"),
            RuntimeError::RuntimeStopped => write!(f, "the fiber runtime is not running"),
            RuntimeError::TimedOut => write!(f, "wait timed out"),
            RuntimeError::Cancelled => write!(f, "operation cancelled"),
            RuntimeError::AllocationFailed => write!(f, "fiber stack allocation failed"),
        }
    }
}

impl std::error::Error for RuntimeError {}

pub type Result<T> = std::result::Result<T, RuntimeError>;
