// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Work executors and the serialization layers built on top of them.
//!
//! An [`Executor`] runs opaque work items on one or more threads. The crate
//! ships three realizations:
//!
//! - [`ThreadPoolExecutor`] - a fixed pool of worker threads plus a shared
//!   [`Reactor`] for deferred work. A process-wide instance sized to the
//!   hardware concurrency is available through
//!   [`ThreadPoolExecutor::default_pool`].
//! - [`ThreadExecutor`] - a single worker thread. Because one thread can
//!   never run two items at once, it is also a [`SequenceExecutor`].
//! - [`StrandExecutor`] - serializes work on top of *any* executor without
//!   dedicating a thread to it.
//!
//! Work submitted with [`ExecMode::InlineIfPossible`] may run synchronously
//! inside the `exec` call when the executor can prove that is safe;
//! [`ExecMode::Queued`] always defers.

// Public API surface.
mod error;
mod event;
mod executor;
mod reactor;
mod strand;
mod thread;
mod thread_pool;

pub use error::*;
pub use event::*;
pub use executor::*;
pub use reactor::*;
pub use strand::*;
pub use thread::*;
pub use thread_pool::*;
