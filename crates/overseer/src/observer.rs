// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyexec::Executor;
use parking_lot::Mutex;
use tether::{AoContext, Error, Future, Result, async_invoke, set_timeout};

use crate::{Consumer, ConsumerList, Producer};

/// A snapshot of an observed state: either the last known value or the
/// error the probe produced.
///
/// Before the first successful probe the state reports
/// [`Error::StateUninitialized`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableState<T>(std::result::Result<T, Error>);

impl<T> ObservableState<T> {
    pub fn new(value: T) -> Self {
        Self(Ok(value))
    }

    pub fn from_error(error: Error) -> Self {
        Self(Err(error))
    }

    pub fn uninitialized() -> Self {
        Self(Err(Error::StateUninitialized))
    }

    pub fn has_value(&self) -> bool {
        self.0.is_ok()
    }

    pub fn has_error(&self) -> bool {
        self.0.is_err()
    }

    pub fn value(&self) -> Option<&T> {
        self.0.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.0.as_ref().err()
    }

    pub fn into_result(self) -> Result<T> {
        self.0
    }
}

type Setter<T> = Box<dyn Fn(T) -> Future<()> + Send + Sync>;
type Getter<T> = Box<dyn Fn() -> Future<T> + Send + Sync>;

struct ObserverInner<T> {
    state: ObservableState<T>,
    /// Replaced wholesale by `set_state`, which cancels in-flight probes.
    cx: AoContext,
}

struct ObserverShared<T: Send + 'static> {
    setter: Setter<T>,
    getter: Getter<T>,
    poll_period: Duration,
    executor: Arc<dyn Executor>,
    consumers: ConsumerList<ObservableState<T>>,
    inner: Mutex<ObserverInner<T>>,
}

/// Periodically polls an external state through a getter future and fans
/// out every change to the attached consumers.
///
/// Writes go through [`set_state`][StateObserver::set_state]: the new value
/// is published optimistically, in-flight probes are cancelled, the setter
/// future runs, and polling resumes with a fresh probe.
pub struct StateObserver<T: Send + 'static> {
    shared: Arc<ObserverShared<T>>,
}

impl<T: Send + 'static> fmt::Debug for StateObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateObserver")
            .field("poll_period", &self.shared.poll_period)
            .finish_non_exhaustive()
    }
}

/// How often the observer probes the getter unless configured otherwise.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(100);

impl<T> StateObserver<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new(
        setter: impl Fn(T) -> Future<()> + Send + Sync + 'static,
        getter: impl Fn() -> Future<T> + Send + Sync + 'static,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self::with_poll_period(setter, getter, executor, DEFAULT_POLL_PERIOD)
    }

    pub fn with_poll_period(
        setter: impl Fn(T) -> Future<()> + Send + Sync + 'static,
        getter: impl Fn() -> Future<T> + Send + Sync + 'static,
        executor: Arc<dyn Executor>,
        poll_period: Duration,
    ) -> Self {
        let shared = Arc::new(ObserverShared {
            setter: Box::new(setter),
            getter: Box::new(getter),
            poll_period,
            executor: Arc::clone(&executor),
            consumers: ConsumerList::new(),
            inner: Mutex::new(ObserverInner {
                state: ObservableState::uninitialized(),
                cx: AoContext::new(executor),
            }),
        });

        Self::schedule_poll(&shared);

        Self { shared }
    }

    /// The last observed state.
    pub fn state(&self) -> ObservableState<T> {
        self.shared.inner.lock().state.clone()
    }

    /// Pushes a new value through the setter.
    ///
    /// The value is committed (and published to consumers) immediately;
    /// pending probes are cancelled so a stale read cannot overwrite it.
    /// After the setter future finishes - successfully or not - polling
    /// starts over.
    pub fn set_state(&self, value: T) {
        let shared = &self.shared;

        let cx_ref = {
            let mut inner = shared.inner.lock();

            // Replacing the context cancels every in-flight probe chain.
            // The old context is closed outside the lock: its continuations
            // may be blocked on this very mutex.
            let previous = std::mem::replace(&mut inner.cx, AoContext::new(Arc::clone(&shared.executor)));
            let cx_ref = inner.cx.handle();

            Self::commit_locked(shared, &mut inner, ObservableState::new(value.clone()));
            drop(inner);

            previous.close();
            cx_ref
        };

        let weak = Arc::downgrade(shared);
        let apply = {
            let weak = Weak::clone(&weak);
            async_invoke(&cx_ref, {
                let shared = Arc::clone(shared);
                move || (shared.setter)(value)
            })
            .flatten()
            .via(&cx_ref)
            .fail(move |error| {
                if let Some(shared) = weak.upgrade() {
                    Self::commit(&shared, ObservableState::from_error(error));
                }
                Ok(())
            })
        };

        let _ = apply.via(&cx_ref).then(move |()| {
            if let Some(shared) = weak.upgrade() {
                Self::poll_now(&shared);
            }
        });
    }

    fn schedule_poll(shared: &Arc<ObserverShared<T>>) {
        let weak = Arc::downgrade(shared);
        let cx_ref = shared.inner.lock().cx.handle();

        let _ = set_timeout(&cx_ref, shared.poll_period, move || {
            if let Some(shared) = weak.upgrade() {
                Self::poll_now(&shared);
            }
        });
    }

    fn poll_now(shared: &Arc<ObserverShared<T>>) {
        let cx_ref = shared.inner.lock().cx.handle();
        let probe = (shared.getter)();

        let on_value = Arc::downgrade(shared);
        let on_error = Arc::downgrade(shared);
        let reschedule = Arc::downgrade(shared);

        let _ = probe
            .via(&cx_ref)
            .then(move |value| {
                if let Some(shared) = on_value.upgrade() {
                    Self::commit(&shared, ObservableState::new(value));
                }
            })
            .via(&cx_ref)
            .fail(move |error| {
                if let Some(shared) = on_error.upgrade() {
                    Self::commit(&shared, ObservableState::from_error(error));
                }
                Ok(())
            })
            .via(&cx_ref)
            .then(move |()| {
                if let Some(shared) = reschedule.upgrade() {
                    Self::schedule_poll(&shared);
                }
            });
    }

    fn commit(shared: &Arc<ObserverShared<T>>, new_state: ObservableState<T>) {
        let mut inner = shared.inner.lock();
        Self::commit_locked(shared, &mut inner, new_state);
    }

    fn commit_locked(
        shared: &ObserverShared<T>,
        inner: &mut ObserverInner<T>,
        new_state: ObservableState<T>,
    ) {
        if inner.state == new_state {
            return;
        }

        inner.state = new_state.clone();
        shared.consumers.consume(&new_state);
    }
}

impl<T> Producer<ObservableState<T>> for StateObserver<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    fn attach_consumer(&self, consumer: Box<dyn Consumer<ObservableState<T>>>) {
        self.shared.consumers.add_consumer(consumer);
    }
}

impl<T: Send + 'static> Drop for StateObserver<T> {
    fn drop(&mut self) {
        // Stop the poll chain before the shared state goes away.
        self.shared.inner.lock().cx.close();
    }
}
