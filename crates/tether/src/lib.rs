// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cancellation-scoped contexts and context-bound future chains.
//!
//! The two core types are:
//!
//! - [`AoContext`] - a cancellation scope that owns a serialization domain
//!   (a strand over some [`Executor`][anyexec::Executor]). Work delivered
//!   through a context runs serially with all other work of that context,
//!   and never after the context has closed.
//! - [`Future`] / [`Promise`] - one-shot result channels whose
//!   continuations can be attached free-standing (they run wherever the
//!   result lands) or *bound to a context* via [`Future::via`]: bound
//!   continuations run inside the context and are cancelled with
//!   [`Error::OperationCancelled`] when it closes, so a consumer always
//!   observes a terminal result.
//!
//! On top of these the crate offers combinators ([`all`], [`CallQueue`],
//! [`DelayedProperty`], [`SafeCallback`]), synchronous and asynchronous
//! in-context invocation ([`invoke`], [`async_invoke`]) and reactor-backed
//! timers ([`set_timeout`], [`delay`], [`set_interval`]).

// Public API surface.
mod all;
mod call_queue;
mod context;
mod delayed_property;
mod error;
mod future;
mod invoke;
mod safe_callback;
mod timer;

pub use all::*;
pub use call_queue::*;
pub use context::*;
pub use delayed_property::*;
pub use error::*;
pub use future::*;
pub use invoke::*;
pub use safe_callback::*;
pub use timer::*;
