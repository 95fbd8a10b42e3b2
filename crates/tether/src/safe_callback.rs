// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use anyexec::ExecMode;

use crate::{AoContextRef, AsAoContextRef, Error, Result};

/// A callable that can be invoked from any thread and delivers each call
/// into its context's serialization domain.
///
/// Invoking the callback after the context has closed fails synchronously
/// with [`Error::ContextClosed`]; the underlying handler is then never run.
/// This is the safe bridge between external event sources (device threads,
/// reactors, producers) and context-bound state.
pub struct SafeCallback<T: Send + 'static> {
    cx: AoContextRef,
    handler: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T: Send + 'static> Clone for SafeCallback<T> {
    fn clone(&self) -> Self {
        Self {
            cx: self.cx.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for SafeCallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeCallback")
            .field("open", &self.cx.is_open())
            .finish()
    }
}

impl<T: Send + 'static> SafeCallback<T> {
    /// Posts `value` to the context for the handler to consume.
    pub fn call(&self, value: T) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let accepted = self
            .cx
            .exec_checked(move || handler(value), ExecMode::Queued);

        if accepted {
            Ok(())
        } else {
            Err(Error::ContextClosed)
        }
    }
}

/// Wraps `handler` into a [`SafeCallback`] bound to `cx`.
pub fn make_safe_callback<T: Send + 'static>(
    cx: &impl AsAoContextRef,
    handler: impl Fn(T) + Send + Sync + 'static,
) -> SafeCallback<T> {
    SafeCallback {
        cx: cx.ao_ref(),
        handler: Arc::new(handler),
    }
}
