// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::Duration;

use anyexec::{ExecMode, Reactor, TimerKey};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::{
    AoContextRef, AsAoContextRef, CloseHandler, CloseHandlerId, Error, Future, Promise, Result,
    make_failed_future, promise_pair,
};

/// A one-shot timer wired into a context: the reactor entry is cancelled
/// when the context closes, and the action is delivered through the
/// context so it never runs after close.
struct TimeoutOp {
    reactor: Reactor,
    cx: AoContextRef,
    key: Mutex<Option<TimerKey>>,
    id: OnceCell<CloseHandlerId>,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TimeoutOp {
    fn fire(self: &Arc<Self>) {
        let op = Arc::clone(self);
        self.cx.exec(
            move || {
                if let Some(id) = op.id.get() {
                    op.cx.remove_close_handler(*id);
                }
                if let Some(action) = op.action.lock().take() {
                    action();
                }
            },
            ExecMode::Queued,
        );
    }
}

impl CloseHandler for TimeoutOp {
    fn on_close(&self) {
        if let Some(key) = self.key.lock().take() {
            let _ = self.reactor.cancel(&key);
        }
    }
}

/// Runs `action` inside the context once `after` has elapsed.
///
/// If the context closes first, the timer is cancelled and the action never
/// runs. Fails if the context is already closed or its executor has no
/// reactor.
pub fn set_timeout(
    cx: &impl AsAoContextRef,
    after: Duration,
    action: impl FnOnce() + Send + 'static,
) -> Result<()> {
    let cx = cx.ao_ref();
    let reactor = cx.executor()?.reactor()?;

    let op = Arc::new(TimeoutOp {
        reactor,
        cx: cx.clone(),
        key: Mutex::new(None),
        id: OnceCell::new(),
        action: Mutex::new(Some(Box::new(action))),
    });

    let id = cx.add_close_handler(Arc::clone(&op) as Arc<dyn CloseHandler>)?;
    let _ = op.id.set(id);

    let fire_op = Arc::clone(&op);
    let key = op.reactor.schedule_after(after, move || fire_op.fire());
    *op.key.lock() = Some(key);

    Ok(())
}

struct DelayOp {
    reactor: Reactor,
    cx: AoContextRef,
    key: Mutex<Option<TimerKey>>,
    id: OnceCell<CloseHandlerId>,
    promise: Mutex<Option<Promise<()>>>,
}

impl DelayOp {
    fn fire(self: &Arc<Self>) {
        let op = Arc::clone(self);
        self.cx.exec(
            move || {
                if let Some(id) = op.id.get() {
                    op.cx.remove_close_handler(*id);
                }
                if let Some(mut promise) = op.promise.lock().take() {
                    let _ = promise.set_value(());
                }
            },
            ExecMode::Queued,
        );
    }
}

impl CloseHandler for DelayOp {
    fn on_close(&self) {
        if let Some(key) = self.key.lock().take() {
            let _ = self.reactor.cancel(&key);
        }
        if let Some(mut promise) = self.promise.lock().take() {
            let _ = promise.set_error(Error::OperationCancelled);
        }
    }
}

/// Returns a future that resolves inside the context once `after` has
/// elapsed, or fails with [`Error::OperationCancelled`] when the context
/// closes first.
pub fn delay(cx: &impl AsAoContextRef, after: Duration) -> Future<()> {
    let cx = cx.ao_ref();

    let reactor = match cx.executor().and_then(|executor| Ok(executor.reactor()?)) {
        Ok(reactor) => reactor,
        Err(error) => return make_failed_future(error),
    };

    let (promise, future) = promise_pair();
    let op = Arc::new(DelayOp {
        reactor,
        cx: cx.clone(),
        key: Mutex::new(None),
        id: OnceCell::new(),
        promise: Mutex::new(Some(promise)),
    });

    let id = match cx.add_close_handler(Arc::clone(&op) as Arc<dyn CloseHandler>) {
        Ok(id) => id,
        Err(error) => return make_failed_future(error),
    };
    let _ = op.id.set(id);

    let fire_op = Arc::clone(&op);
    let key = op.reactor.schedule_after(after, move || fire_op.fire());
    *op.key.lock() = Some(key);

    future
}

struct IntervalOp {
    reactor: Reactor,
    cx: AoContextRef,
    period: Duration,
    key: Mutex<Option<TimerKey>>,
    id: OnceCell<CloseHandlerId>,
    tick: Mutex<Option<Box<dyn FnMut() -> bool + Send>>>,
}

impl IntervalOp {
    fn fire(self: &Arc<Self>) {
        let op = Arc::clone(self);
        self.cx.exec(
            move || {
                let Some(mut tick) = op.tick.lock().take() else {
                    return;
                };

                if tick() {
                    *op.tick.lock() = Some(tick);

                    let fire_op = Arc::clone(&op);
                    let key = op.reactor.schedule_after(op.period, move || fire_op.fire());
                    *op.key.lock() = Some(key);
                } else if let Some(id) = op.id.get() {
                    op.cx.remove_close_handler(*id);
                }
            },
            ExecMode::Queued,
        );
    }
}

impl CloseHandler for IntervalOp {
    fn on_close(&self) {
        if let Some(key) = self.key.lock().take() {
            let _ = self.reactor.cancel(&key);
        }
    }
}

/// Runs `tick` inside the context every `period` until the context closes
/// or `tick` returns `false`.
pub fn set_interval(
    cx: &impl AsAoContextRef,
    period: Duration,
    tick: impl FnMut() -> bool + Send + 'static,
) -> Result<()> {
    let cx = cx.ao_ref();
    let reactor = cx.executor()?.reactor()?;

    let op = Arc::new(IntervalOp {
        reactor,
        cx: cx.clone(),
        period,
        key: Mutex::new(None),
        id: OnceCell::new(),
        tick: Mutex::new(Some(Box::new(tick))),
    });

    let id = cx.add_close_handler(Arc::clone(&op) as Arc<dyn CloseHandler>)?;
    let _ = op.id.set(id);

    let fire_op = Arc::clone(&op);
    let key = op.reactor.schedule_after(period, move || fire_op.fire());
    *op.key.lock() = Some(key);

    Ok(())
}
