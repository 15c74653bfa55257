use thiserror::Error;

use crate::failure::Failure;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the pump and its adapters.
///
/// Computation failures are wrapped in [`Failure`]; graceful stops and forced
/// aborts are separate variants so callers can branch on them.
#[derive(Debug, Error)]
pub enum Error {
    /// A value presented to an adapter does not have the required shape.
    #[error("{role} is invalid: {reason}")]
    InvalidArgument { role: String, reason: String },

    #[error("{type_name} is not awaitable")]
    NotAwaitable { type_name: &'static str },

    /// `get_result` was called before the computation completed.
    #[error("the awaited computation has not completed")]
    NotCompleted,

    /// A pump operation restricted to the owning thread was called elsewhere.
    #[error("the pump can only be driven by its owning thread")]
    WrongThread,

    #[error("the pump has been closed")]
    Closed,

    /// A callback run through `send` panicked on the owning thread.
    #[error("callback failed: {0}")]
    Callback(Failure),

    #[error("computation failed: {0}")]
    Failed(Failure),

    #[error("execution was stopped")]
    Stopped,

    #[error("execution was aborted")]
    Aborted,

    #[error("failed to spawn test thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
