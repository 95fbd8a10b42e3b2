// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod chain;
mod state;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyexec::Event;

use crate::{AoContextRef, AsAoContextRef, Error, Result};
use chain::{
    BoundAndThen, BoundFail, BoundSlot, BoundThen, EventCallback, FlattenCallback, InlineAndThen,
    InlineFail, InlineThen,
};
pub(crate) use state::FutureState;

/// The consumer side of a one-shot result channel.
///
/// A future eventually observes exactly one of a value, an error, or
/// [`Error::BrokenPromise`] if the producer was dropped without delivering.
/// Continuations attach either free-standing ([`then`][Future::then],
/// [`and_then`][Future::and_then], [`fail`][Future::fail] - they run on
/// whichever thread completes the rendezvous) or bound to a context via
/// [`via`][Future::via].
///
/// Once [`wait`][Future::wait], [`wait_for`][Future::wait_for] or
/// [`get`][Future::get] has been called, the future is a *wait future*:
/// further chaining fails with [`Error::ChainAfterWait`].
pub struct Future<T: Send + 'static> {
    state: Arc<FutureState<T>>,
    wait_event: Option<Arc<Event>>,
}

impl<T: Send + 'static> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .field("wait_future", &self.is_wait_future())
            .finish()
    }
}

impl<T: Send + 'static> Future<T> {
    pub(crate) fn from_state(state: Arc<FutureState<T>>) -> Self {
        Self {
            state,
            wait_event: None,
        }
    }

    pub(crate) fn into_state(self) -> Arc<FutureState<T>> {
        self.state
    }

    /// Whether the result is already present.
    pub fn is_ready(&self) -> bool {
        self.state.has_result()
    }

    /// Whether `wait`, `wait_for` or `get` has been called.
    pub fn is_wait_future(&self) -> bool {
        self.wait_event.is_some()
    }

    /// Blocks until the result is available and consumes it.
    pub fn get(mut self) -> Result<T> {
        if !self.state.has_result() {
            self.ensure_wait_event().wait();
        }

        self.state.take_result()
    }

    /// Blocks until the result becomes available.
    pub fn wait(&mut self) {
        self.ensure_wait_event().wait();
    }

    /// Blocks until the result becomes available or `timeout` elapses.
    ///
    /// Returns whether the future is ready. A timeout does not cancel the
    /// underlying operation.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        self.ensure_wait_event().wait_for(timeout)
    }

    fn ensure_wait_event(&mut self) -> Arc<Event> {
        if let Some(event) = &self.wait_event {
            return Arc::clone(event);
        }

        let event = Arc::new(Event::new());
        self.state.install_callback(Box::new(EventCallback {
            event: Arc::clone(&event),
        }));
        self.wait_event = Some(Arc::clone(&event));

        event
    }

    /// Binds subsequent continuations to `cx`: they will run inside the
    /// context and be cancelled if it closes first.
    pub fn via(self, cx: &impl AsAoContextRef) -> BoundFuture<T> {
        BoundFuture {
            inner: self,
            cx: cx.ao_ref(),
        }
    }

    /// Attaches a free-standing continuation for the success path.
    ///
    /// The continuation runs on whichever thread completes the rendezvous:
    /// the producer's thread if the result lands last, the attaching thread
    /// if the future is already ready. Failures skip `body` and propagate.
    pub fn then<U, F>(self, body: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        if self.is_wait_future() {
            return make_failed_future(Error::ChainAfterWait);
        }

        let next = FutureState::new();
        self.state.install_callback(Box::new(InlineThen {
            next: Arc::clone(&next),
            body,
        }));

        Future::from_state(next)
    }

    /// Like [`then`][Future::then] for fallible continuations; an `Err`
    /// settles the next future with that error.
    pub fn and_then<U, F>(self, body: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        if self.is_wait_future() {
            return make_failed_future(Error::ChainAfterWait);
        }

        let next = FutureState::new();
        self.state.install_callback(Box::new(InlineAndThen {
            next: Arc::clone(&next),
            body,
        }));

        Future::from_state(next)
    }

    /// Attaches a free-standing error handler. Successes pass through
    /// untouched; a failure runs `body`, which may recover (`Ok`) or
    /// replace the error (`Err`).
    pub fn fail<F>(self, body: F) -> Future<T>
    where
        F: FnOnce(Error) -> Result<T> + Send + 'static,
    {
        if self.is_wait_future() {
            return make_failed_future(Error::ChainAfterWait);
        }

        let next = FutureState::new();
        self.state.install_callback(Box::new(InlineFail {
            next: Arc::clone(&next),
            body,
        }));

        Future::from_state(next)
    }
}

impl<T: Send + 'static> Future<Future<T>> {
    /// Collapses one level of nesting: the returned future settles with the
    /// inner future's result (or with the outer failure).
    pub fn flatten(self) -> Future<T> {
        if self.is_wait_future() {
            return make_failed_future(Error::ChainAfterWait);
        }

        let target = FutureState::new();
        self.state.install_callback(Box::new(FlattenCallback {
            target: Arc::clone(&target),
        }));

        Future::from_state(target)
    }
}

/// A [`Future`] whose continuations are bound to an [`AoContext`].
///
/// Bound continuations run inside the context's serialization domain. If
/// the context closes before the upstream resolves, the downstream future
/// settles with [`Error::OperationCancelled`] instead - the consumer always
/// observes a terminal result.
///
/// [`AoContext`]: crate::AoContext
#[derive(Debug)]
pub struct BoundFuture<T: Send + 'static> {
    inner: Future<T>,
    cx: AoContextRef,
}

impl<T: Send + 'static> BoundFuture<T> {
    /// Attaches a continuation for the success path, run inside the bound
    /// context.
    pub fn then<U, F>(self, body: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let Self { inner, cx } = self;
        if inner.is_wait_future() {
            return make_failed_future(Error::ChainAfterWait);
        }

        let next = FutureState::new();
        let slot = match BoundSlot::register(&cx, Arc::clone(&next)) {
            Ok(slot) => slot,
            Err(error) => return make_failed_future(error),
        };

        inner
            .state
            .install_callback(Box::new(BoundThen { slot, body }));

        Future::from_state(next)
    }

    /// Like [`then`][BoundFuture::then] for fallible continuations.
    pub fn and_then<U, F>(self, body: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let Self { inner, cx } = self;
        if inner.is_wait_future() {
            return make_failed_future(Error::ChainAfterWait);
        }

        let next = FutureState::new();
        let slot = match BoundSlot::register(&cx, Arc::clone(&next)) {
            Ok(slot) => slot,
            Err(error) => return make_failed_future(error),
        };

        inner
            .state
            .install_callback(Box::new(BoundAndThen { slot, body }));

        Future::from_state(next)
    }

    /// Attaches an error handler, run inside the bound context.
    pub fn fail<F>(self, body: F) -> Future<T>
    where
        F: FnOnce(Error) -> Result<T> + Send + 'static,
    {
        let Self { inner, cx } = self;
        if inner.is_wait_future() {
            return make_failed_future(Error::ChainAfterWait);
        }

        let next = FutureState::new();
        let slot = match BoundSlot::register(&cx, Arc::clone(&next)) {
            Ok(slot) => slot,
            Err(error) => return make_failed_future(error),
        };

        inner
            .state
            .install_callback(Box::new(BoundFail { slot, body }));

        Future::from_state(next)
    }
}

/// The producer side of a one-shot result channel.
///
/// A promise is satisfied at most once, with a value or an error. Dropping
/// an unsatisfied promise settles the channel with
/// [`Error::BrokenPromise`], so the consumer never waits forever.
pub struct Promise<T: Send + 'static> {
    state: Arc<FutureState<T>>,
    satisfied: bool,
    retrieved: bool,
}

impl<T: Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("satisfied", &self.satisfied)
            .field("retrieved", &self.retrieved)
            .finish()
    }
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: FutureState::new(),
            satisfied: false,
            retrieved: false,
        }
    }

    /// Satisfies the promise with a value.
    pub fn set_value(&mut self, value: T) -> Result<()> {
        if self.satisfied {
            return Err(Error::PromiseAlreadySatisfied);
        }

        self.satisfied = true;
        self.state.set_result(Ok(value));
        Ok(())
    }

    /// Satisfies the promise with an error.
    pub fn set_error(&mut self, error: Error) -> Result<()> {
        if self.satisfied {
            return Err(Error::PromiseAlreadySatisfied);
        }

        self.satisfied = true;
        self.state.set_result(Err(error));
        Ok(())
    }

    /// Retrieves the future. May be called once; a second call fails with
    /// [`Error::FutureAlreadyRetrieved`].
    pub fn future(&mut self) -> Result<Future<T>> {
        if self.retrieved {
            return Err(Error::FutureAlreadyRetrieved);
        }

        self.retrieved = true;
        Ok(Future::from_state(Arc::clone(&self.state)))
    }

    pub fn satisfied(&self) -> bool {
        self.satisfied
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.satisfied {
            self.state.set_result(Err(Error::BrokenPromise));
        }
    }
}

/// Creates a connected promise/future pair.
pub(crate) fn promise_pair<T: Send + 'static>() -> (Promise<T>, Future<T>) {
    let state = FutureState::new();
    let future = Future::from_state(Arc::clone(&state));
    let promise = Promise {
        state,
        satisfied: false,
        retrieved: true,
    };

    (promise, future)
}

/// A future that is already resolved with `value`.
pub fn make_ready_future<T: Send + 'static>(value: T) -> Future<T> {
    let state = FutureState::new();
    state.set_result(Ok(value));
    Future::from_state(state)
}

/// A future that is already failed with `error`.
pub fn make_failed_future<T: Send + 'static>(error: Error) -> Future<T> {
    let state = FutureState::new();
    state.set_result(Err(error));
    Future::from_state(state)
}

/// Runs `body` on a freshly spawned thread and delivers its result (or its
/// panic, as [`Error::CallbackPanicked`]) through the returned future.
pub fn to_thread<T, F>(body: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (mut promise, future) = promise_pair();

    let _detached = thread::Builder::new()
        .name("tether-to-thread".to_owned())
        .spawn(move || match catch_unwind(AssertUnwindSafe(body)) {
            Ok(value) => {
                let _ = promise.set_value(value);
            }
            Err(payload) => {
                let _ = promise.set_error(Error::from_panic(payload));
            }
        })
        .expect("failed to spawn to_thread worker");

    future
}

/// Appends a fresh promise to `promises` and returns its future.
///
/// This is the shape state machines use for their waiter lists: every
/// caller interested in a transition parks a promise here, and the
/// transition resolves the whole list at once.
pub fn promise_list_future<T: Send + 'static>(promises: &mut Vec<Promise<T>>) -> Future<T> {
    let (promise, future) = promise_pair();
    promises.push(promise);
    future
}

/// Satisfies every promise in `promises` with (a clone of) `value`.
pub fn resolve_promises<T: Clone + Send + 'static>(
    promises: impl IntoIterator<Item = Promise<T>>,
    value: T,
) {
    for mut promise in promises {
        let _ = promise.set_value(value.clone());
    }
}

/// Fails every promise in `promises` with (a clone of) `error`.
pub fn reject_promises<T: Send + 'static>(
    promises: impl IntoIterator<Item = Promise<T>>,
    error: &Error,
) {
    for mut promise in promises {
        let _ = promise.set_error(error.clone());
    }
}
