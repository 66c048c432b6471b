//! Errors produced by the lock-free structures, queues and executors.
use thiserror::Error;

/// An error produced by an operation on one of the runtime's structures.
///
/// Contention between threads is never reported using this type: it's
/// resolved internally by retrying.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// The structure contained no values at the time of the operation.
    #[error("the structure is empty")]
    Empty,

    /// A bounded structure had no room left for another value.
    #[error("the structure is full")]
    Full,

    /// A value or argument was rejected before it could be used.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The executor no longer accepts new work.
    #[error("the executor has been shut down")]
    ShutDown,
}
