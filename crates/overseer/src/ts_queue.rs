// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct TsQueueInner<T> {
    values: VecDeque<T>,
    closed: bool,
}

/// A closeable bounded queue for bridging threads.
///
/// Writers block while the queue is full, readers while it is empty; both
/// have timed variants. [`close`][TsQueue::close] wakes everyone: writes
/// start failing immediately, reads keep draining buffered values and fail
/// once the queue is empty.
pub struct TsQueue<T> {
    capacity: usize,
    inner: Mutex<TsQueueInner<T>>,
    readable: Condvar,
    writable: Condvar,
}

impl<T> fmt::Debug for TsQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TsQueue")
            .field("len", &inner.values.len())
            .field("capacity", &self.capacity)
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T> TsQueue<T> {
    /// An effectively unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "a queue needs room for at least one value");

        Self {
            capacity,
            inner: Mutex::new(TsQueueInner {
                values: VecDeque::new(),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    /// Closes the queue and wakes all blocked readers and writers.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Blocks until there is room, then enqueues `value`. Returns whether
    /// the value was accepted (`false` once closed).
    pub fn write(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        while !inner.closed && inner.values.len() >= self.capacity {
            self.writable.wait(&mut inner);
        }

        if inner.closed {
            return false;
        }

        inner.values.push_back(value);
        drop(inner);

        self.readable.notify_one();
        true
    }

    /// Like [`write`][Self::write] with a timeout; `false` on timeout or
    /// close.
    pub fn write_for(&self, value: T, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        let result = self.writable.wait_while_for(
            &mut inner,
            |inner| !inner.closed && inner.values.len() >= self.capacity,
            timeout,
        );

        if result.timed_out() || inner.closed {
            return false;
        }

        inner.values.push_back(value);
        drop(inner);

        self.readable.notify_one();
        true
    }

    /// Blocks until a value is available and dequeues it. `None` means the
    /// queue is closed and drained.
    pub fn read(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        while !inner.closed && inner.values.is_empty() {
            self.readable.wait(&mut inner);
        }

        let value = inner.values.pop_front()?;
        drop(inner);

        self.writable.notify_one();
        Some(value)
    }

    /// Like [`read`][Self::read] with a timeout.
    pub fn read_for(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        let _ = self.readable.wait_while_for(
            &mut inner,
            |inner| !inner.closed && inner.values.is_empty(),
            timeout,
        );

        let value = inner.values.pop_front()?;
        drop(inner);

        self.writable.notify_one();
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().values.is_empty()
    }
}

impl<T> Default for TsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
