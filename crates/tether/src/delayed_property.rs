// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{Error, Future, Promise, Result, promise_pair};

struct PropertyInner<T> {
    value: T,
    new_value: Option<T>,
    promise: Option<Promise<()>>,
}

/// A thread-safe property whose writes take effect only when the owner
/// applies them.
///
/// A writer offers a value with [`set_value`][DelayedProperty::set_value]
/// and receives a future that resolves once the owner has applied it (or
/// fails if the offer was superseded or rejected). The owner observes
/// pending offers with the `wait_new_value` family and commits them with
/// [`apply_new_value`][DelayedProperty::apply_new_value].
pub struct DelayedProperty<T> {
    inner: Mutex<PropertyInner<T>>,
    offered: Condvar,
}

impl<T> fmt::Debug for DelayedProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedProperty")
            .field("pending", &self.inner.lock().new_value.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> DelayedProperty<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(PropertyInner {
                value,
                new_value: None,
                promise: None,
            }),
            offered: Condvar::new(),
        }
    }

    /// Offers a new value. A still-pending previous offer is failed with
    /// [`Error::OperationCancelled`].
    pub fn set_value(&self, value: T) -> Future<()> {
        let mut inner = self.inner.lock();

        if let Some(mut superseded) = inner.promise.take() {
            let _ = superseded.set_error(Error::OperationCancelled);
        }

        let (promise, future) = promise_pair();
        inner.promise = Some(promise);
        inner.new_value = Some(value);
        drop(inner);

        self.offered.notify_all();
        future
    }

    pub fn has_new_value(&self) -> bool {
        self.inner.lock().promise.is_some()
    }

    /// Blocks until a new value has been offered.
    pub fn wait_new_value(&self) {
        let mut inner = self.inner.lock();
        while inner.promise.is_none() {
            self.offered.wait(&mut inner);
        }
    }

    /// Blocks until a new value has been offered or `timeout` elapses;
    /// returns whether an offer is pending.
    pub fn wait_new_value_for(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        let _ = self
            .offered
            .wait_while_for(&mut inner, |inner| inner.promise.is_none(), timeout);
        inner.promise.is_some()
    }

    /// Commits the pending offer, if any.
    ///
    /// `apply` runs with the property unlocked. On `Ok` the offer becomes
    /// the current value and the writer's future resolves; on `Err` (or a
    /// panic) the value is left unchanged and the failure is delivered to
    /// the writer.
    pub fn apply_new_value(&self, apply: impl FnOnce(&T) -> Result<()>) {
        let mut inner = self.inner.lock();
        if inner.promise.is_none() {
            return;
        }
        let new_value = inner.new_value.take().expect("an offer always carries a value");
        let mut promise = inner.promise.take().expect("checked above");
        drop(inner);

        let outcome = match catch_unwind(AssertUnwindSafe(|| apply(&new_value))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(Error::from_panic(payload)),
        };

        match outcome {
            Ok(()) => {
                self.inner.lock().value = new_value;
                let _ = promise.set_value(());
            }
            Err(error) => {
                let _ = promise.set_error(error);
            }
        }
    }

    /// Commits the pending offer without an apply step.
    pub fn apply(&self) {
        self.apply_new_value(|_| Ok(()));
    }

    pub fn current_value(&self) -> T {
        self.inner.lock().value.clone()
    }
}
