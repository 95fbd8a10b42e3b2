// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::{AsAoContextRef, Future, Result, make_ready_future};

/// Runs `body` inside the context and returns a future for its result.
///
/// The body is delivered through the context's strand, so it runs serially
/// with all other work of that context. If the context closes first, the
/// returned future settles with
/// [`Error::OperationCancelled`][crate::Error::OperationCancelled].
pub fn async_invoke<R, F>(cx: &impl AsAoContextRef, body: F) -> Future<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    make_ready_future(()).via(cx).then(move |()| body())
}

/// Runs `body` inside the context and blocks for its result.
///
/// When the caller is already executing inside the context's group the body
/// runs inline - posting and blocking would wait on a strand that only this
/// thread can drain.
pub fn invoke<R, F>(cx: &impl AsAoContextRef, body: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    if cx.ao_ref().in_this_thread() {
        return Ok(body());
    }

    async_invoke(cx, body).get()
}
