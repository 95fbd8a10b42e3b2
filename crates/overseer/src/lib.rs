// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cooperative task control and the patterns built on top of it.
//!
//! - [`ManageableTask`] - a worker thread running a user function that
//!   polls a [`checkpoint`][TaskContext::checkpoint]; through it the task
//!   can be paused, resumed and stopped cooperatively.
//! - [`Scheduler`] - a priority queue of manageable tasks with exactly one
//!   active task; a higher-priority push preempts the active task at its
//!   next checkpoint.
//! - [`StateObserver`] - periodically polls an external state through a
//!   getter future and fans out changes to consumers.
//! - Producer/consumer plumbing ([`Producer`], [`Consumer`],
//!   [`ConsumerList`], [`FuncProducer`], [`Notifier`], [`TsQueue`]) that
//!   bridges external event sources into contexts safely.

// Public API surface.
mod consumer;
mod func_producer;
mod manageable_task;
mod notifier;
mod observer;
mod scheduler;
mod ts_queue;

pub use consumer::*;
pub use func_producer::*;
pub use manageable_task::*;
pub use notifier::*;
pub use observer::*;
pub use scheduler::*;
pub use ts_queue::*;
