// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use thiserror::Error;

/// A specialized `Result` type for operations that return a tether
/// [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// The error currency of the whole substrate.
///
/// This is an umbrella type: futures carry it as their failure value,
/// contexts report it from attach operations, and the task layers above
/// reuse it. User failures travel either as [`Error::Other`] (a value
/// returned from a fallible continuation) or as [`Error::CallbackPanicked`]
/// (a panic captured at a continuation boundary).
///
/// The type is cheap to clone so a single failure can settle several
/// futures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// An asynchronous operation was cancelled because its context closed
    /// or its task was stopped.
    #[error("the asynchronous operation was cancelled")]
    OperationCancelled,

    /// New work or handlers were attached to a context that is already
    /// closing or closed.
    #[error("the context is closed")]
    ContextClosed,

    /// The promise was dropped without being satisfied.
    #[error("the promise was dropped before delivering a result")]
    BrokenPromise,

    /// `set_value` or `set_error` was called on an already satisfied
    /// promise.
    #[error("the promise is already satisfied")]
    PromiseAlreadySatisfied,

    /// `future()` was called twice on the same promise.
    #[error("the future was already retrieved from this promise")]
    FutureAlreadyRetrieved,

    /// `then`/`fail` was attached to a future after `wait`, `wait_for` or
    /// `get`.
    #[error("cannot chain a future after waiting on it")]
    ChainAfterWait,

    /// A synchronous call from inside the target context would block on
    /// work that only that context can run.
    #[error("blocking on the context from inside itself would deadlock")]
    DetectedDeadlock,

    /// An observed state was probed before any state was known.
    #[error("the observed state is not initialized yet")]
    StateUninitialized,

    /// A user continuation panicked; the payload message is preserved.
    #[error("a continuation panicked: {0}")]
    CallbackPanicked(String),

    /// An executor-level failure, e.g. scheduling deferred work on an
    /// executor without a reactor.
    #[error(transparent)]
    Executor(#[from] anyexec::Error),

    /// An error produced by user code.
    #[error("{0}")]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps a user error.
    pub fn other(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Arc::new(error))
    }

    /// Converts a panic payload into an error, preserving string payloads.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|message| (*message).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());

        Self::CallbackPanicked(message)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::OperationCancelled, Self::OperationCancelled)
            | (Self::ContextClosed, Self::ContextClosed)
            | (Self::BrokenPromise, Self::BrokenPromise)
            | (Self::PromiseAlreadySatisfied, Self::PromiseAlreadySatisfied)
            | (Self::FutureAlreadyRetrieved, Self::FutureAlreadyRetrieved)
            | (Self::ChainAfterWait, Self::ChainAfterWait)
            | (Self::DetectedDeadlock, Self::DetectedDeadlock)
            | (Self::StateUninitialized, Self::StateUninitialized) => true,
            (Self::CallbackPanicked(left), Self::CallbackPanicked(right)) => left == right,
            (Self::Executor(left), Self::Executor(right)) => left == right,
            // User errors have no equality of their own; identity is the
            // only comparison that does not lie.
            (Self::Other(left), Self::Other(right)) => Arc::ptr_eq(left, right),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Error: Send, Sync, Clone);
    }

    #[test]
    fn user_errors_compare_by_identity() {
        let first = Error::other(std::io::Error::other("dummy"));
        let second = Error::other(std::io::Error::other("dummy"));

        assert_eq!(first, first.clone());
        assert_ne!(first, second);
    }

    #[test]
    fn panic_payloads_keep_their_message() {
        let error = Error::from_panic(Box::new("boom"));
        assert_eq!(error, Error::CallbackPanicked("boom".to_owned()));
        assert_eq!(error.to_string(), "a continuation panicked: boom");
    }
}
