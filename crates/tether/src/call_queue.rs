// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{AsAoContextRef, Future, make_ready_future, promise_pair};

/// Serializes calls through a context by chaining them on an internal
/// `Future<()>` tail.
///
/// Every [`push`][CallQueue::push] appends the call behind all previously
/// pushed calls; they execute in push order inside the given context. One
/// call's failure is delivered through that call's returned future and does
/// not stop the queue.
///
/// The queue itself is a single-owner object (`push` takes `&mut self`);
/// the calls it dispatches are what run asynchronously.
pub struct CallQueue {
    chain: Future<()>,
}

impl fmt::Debug for CallQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallQueue").finish_non_exhaustive()
    }
}

impl CallQueue {
    pub fn new() -> Self {
        Self {
            chain: make_ready_future(()),
        }
    }

    /// Appends `body` to the queue and returns a future for its result.
    pub fn push<R, F>(&mut self, cx: &impl AsAoContextRef, body: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (promise, result_future) = promise_pair::<R>();
        let promise = Arc::new(Mutex::new(promise));

        let previous = std::mem::replace(&mut self.chain, make_ready_future(()));

        let deliver = Arc::clone(&promise);
        let call = previous.via(cx).then(move |()| body());
        let forwarded = call.via(cx).then(move |value| {
            let _ = deliver.lock().set_value(value);
        });
        // Forward failures (of the call itself or a cancelled chain) to the
        // result future and keep the tail succeeding so later pushes run.
        self.chain = forwarded.via(cx).fail(move |error| {
            let _ = promise.lock().set_error(error);
            Ok(())
        });

        result_future
    }
}

impl Default for CallQueue {
    fn default() -> Self {
        Self::new()
    }
}
