// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use tether::{AoContext, Result, SafeCallback, make_safe_callback};

use crate::{ConsumeStatus, Consumer, Producer};

/// Delivers produced values into a context-bound handler.
///
/// The notifier owns a child context of the one it was created on; every
/// consumed value is posted into that context through a safe callback, so
/// the handler runs serialized with the context's other work and never
/// after the notifier (or its parent context) is gone. Dropping the
/// notifier closes its context, which makes every attached input report
/// [`ConsumeStatus::Closed`] and detach.
pub struct Notifier<T: Send + 'static> {
    cx: AoContext,
    callback: SafeCallback<T>,
}

impl<T: Send + 'static> fmt::Debug for Notifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("open", &self.cx.is_open())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Notifier<T> {
    /// Creates a notifier whose handler runs in a child context of
    /// `parent`. Fails if the parent is already closing.
    pub fn new(parent: &AoContext, handler: impl Fn(&T) + Send + Sync + 'static) -> Result<Self> {
        let cx = parent.new_child()?;
        let callback = make_safe_callback(&cx, move |value: T| handler(&value));

        Ok(Self { cx, callback })
    }

    /// A consumer endpoint feeding this notifier.
    pub fn subscribe(&self) -> Box<dyn Consumer<T>>
    where
        T: Clone,
    {
        Box::new(NotifierInput {
            callback: self.callback.clone(),
        })
    }

    /// Attaches a fresh input of this notifier to `producer`.
    pub fn attach_to(&self, producer: &dyn Producer<T>)
    where
        T: Clone,
    {
        producer.attach_consumer(self.subscribe());
    }
}

impl<T: Send + 'static> Drop for Notifier<T> {
    fn drop(&mut self) {
        self.cx.close();
    }
}

struct NotifierInput<T: Send + 'static> {
    callback: SafeCallback<T>,
}

impl<T: Clone + Send + 'static> Consumer<T> for NotifierInput<T> {
    fn consume(&mut self, value: &T) -> ConsumeStatus {
        match self.callback.call(value.clone()) {
            Ok(()) => ConsumeStatus::Ok,
            Err(_closed) => ConsumeStatus::Closed,
        }
    }
}
