// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Continuation callbacks installed on a [`FutureState`].
//!
//! Free-standing continuations run directly on the thread that completes
//! the rendezvous. Context-bound continuations instead hop onto their
//! context's strand and double as close handlers there, which is what turns
//! a context close into cancellation of the whole downstream chain.

use std::sync::Arc;

use anyexec::{Event, ExecMode};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::state::{FutureState, StateCallback, Trigger};
use crate::{AoContextRef, CloseHandler, CloseHandlerId, Error, Future, Result};

/// Attaching to an already-ready future prefers inline execution (the
/// attach is the completing transition, a queue hop would only add
/// latency); a result landing later is queued.
fn dispatch_mode(trigger: Trigger) -> ExecMode {
    match trigger {
        Trigger::Callback => ExecMode::InlineIfPossible,
        Trigger::Result => ExecMode::Queued,
    }
}

/// Signals a wait event once the state settles.
pub(super) struct EventCallback {
    pub event: Arc<Event>,
}

impl<T: Send + 'static> StateCallback<T> for EventCallback {
    fn future_ready(self: Box<Self>, _state: &Arc<FutureState<T>>, _trigger: Trigger) {
        self.event.set();
    }
}

/// Free-standing `then`.
pub(super) struct InlineThen<U: Send + 'static, F> {
    pub next: Arc<FutureState<U>>,
    pub body: F,
}

impl<T, U, F> StateCallback<T> for InlineThen<U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    fn future_ready(self: Box<Self>, state: &Arc<FutureState<T>>, _trigger: Trigger) {
        let Self { next, body } = *self;
        match state.take_result() {
            Ok(value) => next.fulfill_with(|| body(value)),
            Err(error) => next.set_result(Err(error)),
        }
    }
}

/// Free-standing `and_then`.
pub(super) struct InlineAndThen<U: Send + 'static, F> {
    pub next: Arc<FutureState<U>>,
    pub body: F,
}

impl<T, U, F> StateCallback<T> for InlineAndThen<U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> Result<U> + Send + 'static,
{
    fn future_ready(self: Box<Self>, state: &Arc<FutureState<T>>, _trigger: Trigger) {
        let Self { next, body } = *self;
        match state.take_result() {
            Ok(value) => next.fulfill_try_with(|| body(value)),
            Err(error) => next.set_result(Err(error)),
        }
    }
}

/// Free-standing `fail`: successes pass through, failures run the handler.
pub(super) struct InlineFail<T: Send + 'static, F> {
    pub next: Arc<FutureState<T>>,
    pub body: F,
}

impl<T, F> StateCallback<T> for InlineFail<T, F>
where
    T: Send + 'static,
    F: FnOnce(Error) -> Result<T> + Send + 'static,
{
    fn future_ready(self: Box<Self>, state: &Arc<FutureState<T>>, _trigger: Trigger) {
        let Self { next, body } = *self;
        match state.take_result() {
            Ok(value) => next.set_result(Ok(value)),
            Err(error) => next.fulfill_try_with(|| body(error)),
        }
    }
}

/// Collapses `Future<Future<T>>` by one level: once the outer settles, the
/// inner's result is forwarded into `target`.
pub(super) struct FlattenCallback<T: Send + 'static> {
    pub target: Arc<FutureState<T>>,
}

impl<T: Send + 'static> StateCallback<Future<T>> for FlattenCallback<T> {
    fn future_ready(self: Box<Self>, state: &Arc<FutureState<Future<T>>>, _trigger: Trigger) {
        match state.take_result() {
            Ok(inner) => {
                if inner.is_wait_future() {
                    self.target.set_result(Err(Error::ChainAfterWait));
                    return;
                }

                inner
                    .into_state()
                    .install_callback(Box::new(ForwardCallback {
                        target: self.target,
                    }));
            }
            Err(error) => self.target.set_result(Err(error)),
        }
    }
}

/// Forwards a settled result into another state unchanged.
pub(super) struct ForwardCallback<T: Send + 'static> {
    pub target: Arc<FutureState<T>>,
}

impl<T: Send + 'static> StateCallback<T> for ForwardCallback<T> {
    fn future_ready(self: Box<Self>, state: &Arc<FutureState<T>>, _trigger: Trigger) {
        self.target.set_result(state.take_result());
    }
}

/// The piece of a bound continuation that is registered as a close handler:
/// it owns the downstream state until exactly one of the two outcomes
/// claims it - the continuation runs, or the context closes first and the
/// downstream settles with [`Error::OperationCancelled`].
pub(super) struct BoundSlot<U: Send + 'static> {
    next: Mutex<Option<Arc<FutureState<U>>>>,
    cx: AoContextRef,
    id: OnceCell<CloseHandlerId>,
}

impl<U: Send + 'static> BoundSlot<U> {
    pub fn register(cx: &AoContextRef, next: Arc<FutureState<U>>) -> Result<Arc<Self>> {
        let slot = Arc::new(Self {
            next: Mutex::new(Some(next)),
            cx: cx.clone(),
            id: OnceCell::new(),
        });

        let id = cx.add_close_handler(Arc::clone(&slot) as Arc<dyn CloseHandler>)?;
        let _ = slot.id.set(id);

        Ok(slot)
    }

    fn take_next(&self) -> Option<Arc<FutureState<U>>> {
        self.next.lock().take()
    }

    fn unregister(&self) {
        if let Some(id) = self.id.get() {
            self.cx.remove_close_handler(*id);
        }
    }
}

impl<U: Send + 'static> CloseHandler for BoundSlot<U> {
    fn on_close(&self) {
        if let Some(next) = self.take_next() {
            next.set_result(Err(Error::OperationCancelled));
        }
    }
}

/// Context-bound `then`.
pub(super) struct BoundThen<U: Send + 'static, F> {
    pub slot: Arc<BoundSlot<U>>,
    pub body: F,
}

impl<T, U, F> StateCallback<T> for BoundThen<U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    fn future_ready(self: Box<Self>, state: &Arc<FutureState<T>>, trigger: Trigger) {
        let Self { slot, body } = *self;
        let state = Arc::clone(state);
        let cx = slot.cx.clone();

        cx.exec(
            move || {
                let Some(next) = slot.take_next() else {
                    return;
                };

                match state.take_result() {
                    Ok(value) => next.fulfill_with(|| body(value)),
                    Err(error) => next.set_result(Err(error)),
                }

                slot.unregister();
            },
            dispatch_mode(trigger),
        );
    }
}

/// Context-bound `and_then`.
pub(super) struct BoundAndThen<U: Send + 'static, F> {
    pub slot: Arc<BoundSlot<U>>,
    pub body: F,
}

impl<T, U, F> StateCallback<T> for BoundAndThen<U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> Result<U> + Send + 'static,
{
    fn future_ready(self: Box<Self>, state: &Arc<FutureState<T>>, trigger: Trigger) {
        let Self { slot, body } = *self;
        let state = Arc::clone(state);
        let cx = slot.cx.clone();

        cx.exec(
            move || {
                let Some(next) = slot.take_next() else {
                    return;
                };

                match state.take_result() {
                    Ok(value) => next.fulfill_try_with(|| body(value)),
                    Err(error) => next.set_result(Err(error)),
                }

                slot.unregister();
            },
            dispatch_mode(trigger),
        );
    }
}

/// Context-bound `fail`.
pub(super) struct BoundFail<T: Send + 'static, F> {
    pub slot: Arc<BoundSlot<T>>,
    pub body: F,
}

impl<T, F> StateCallback<T> for BoundFail<T, F>
where
    T: Send + 'static,
    F: FnOnce(Error) -> Result<T> + Send + 'static,
{
    fn future_ready(self: Box<Self>, state: &Arc<FutureState<T>>, trigger: Trigger) {
        let Self { slot, body } = *self;
        let state = Arc::clone(state);
        let cx = slot.cx.clone();

        cx.exec(
            move || {
                let Some(next) = slot.take_next() else {
                    return;
                };

                match state.take_result() {
                    Ok(value) => next.set_result(Ok(value)),
                    Err(error) => next.fulfill_try_with(|| body(error)),
                }

                slot.unregister();
            },
            dispatch_mode(trigger),
        );
    }
}
