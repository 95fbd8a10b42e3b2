// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A specialized `Result` type for executor operations that return an
/// executor [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The executor has no reactor attached, so deferred work cannot be
    /// scheduled through it.
    #[error("the executor does not expose a reactor")]
    NoReactor,
}
