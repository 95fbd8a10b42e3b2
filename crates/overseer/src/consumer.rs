// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use parking_lot::Mutex;

/// Outcome of delivering a value to a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStatus {
    /// The value was accepted; keep delivering.
    Ok,
    /// The consumer is gone (e.g. its context closed); detach it.
    Closed,
}

/// A sink for values pushed by a [`Producer`].
pub trait Consumer<T>: Send {
    fn consume(&mut self, value: &T) -> ConsumeStatus;
}

/// A source that pushes values into attached consumers.
pub trait Producer<T> {
    fn attach_consumer(&self, consumer: Box<dyn Consumer<T>>);
}

struct ConsumerListInner<T> {
    consumers: Vec<Box<dyn Consumer<T>>>,
    closed: bool,
}

/// Fans one value stream out to many consumers.
///
/// Consumers that report [`ConsumeStatus::Closed`] are dropped from the
/// list; a panicking consumer is kept (its failure is logged and treated
/// as accepted). After [`close`][ConsumerList::close] all consumers are
/// released and further deliveries report `Closed`.
pub struct ConsumerList<T> {
    inner: Mutex<ConsumerListInner<T>>,
}

impl<T> fmt::Debug for ConsumerList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConsumerList")
            .field("consumers", &inner.consumers.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T> ConsumerList<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConsumerListInner {
                consumers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Releases every consumer; subsequent deliveries report `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.consumers.clear();
    }

    /// Attaches a consumer. On a closed list the consumer is dropped.
    pub fn add_consumer(&self, consumer: Box<dyn Consumer<T>>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        inner.consumers.push(consumer);
    }

    /// Delivers `value` to every attached consumer.
    pub fn consume(&self, value: &T) -> ConsumeStatus {
        let mut taken = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return ConsumeStatus::Closed;
            }
            std::mem::take(&mut inner.consumers)
        };

        // Deliver with the list unlocked; consumers may take arbitrary
        // time or attach further consumers.
        taken.retain_mut(|consumer| {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| consumer.consume(value)))
            {
                Ok(ConsumeStatus::Ok) => true,
                Ok(ConsumeStatus::Closed) => false,
                Err(_) => {
                    tracing::warn!(target: "overseer", "a consumer panicked; the panic was discarded");
                    true
                }
            }
        });

        let mut inner = self.inner.lock();
        if inner.closed {
            return ConsumeStatus::Closed;
        }

        // Consumers attached while we were delivering sit at the front so
        // the relative order of survivors is preserved.
        taken.append(&mut inner.consumers);
        inner.consumers = taken;

        ConsumeStatus::Ok
    }
}

impl<T> Default for ConsumerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Consumer<T> for ConsumerList<T> {
    fn consume(&mut self, value: &T) -> ConsumeStatus {
        ConsumerList::consume(self, value)
    }
}
