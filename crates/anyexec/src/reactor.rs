// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Unique identifier for a scheduled reactor entry.
///
/// Keys order by deadline; the discriminator ensures two entries with the
/// same deadline can coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    deadline: Instant,
    discriminator: u64,
}

impl TimerKey {
    const fn new(deadline: Instant, discriminator: u64) -> Self {
        Self {
            deadline,
            discriminator,
        }
    }

    /// Determines when the entry fires.
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }
}

type TimerFn = Box<dyn FnOnce() + Send + 'static>;

struct ReactorInner {
    /// Entries ordered by the instant at which they fire.
    timers: BTreeMap<TimerKey, TimerFn>,
    last_discriminator: u64,
    shutdown: bool,
}

struct ReactorShared {
    inner: Mutex<ReactorInner>,
    wakeup: Condvar,
}

/// A long-lived service that deferred work can be scheduled on.
///
/// The reactor owns a dedicated driver thread. Callbacks run on that thread
/// at (or shortly after) their deadline, so they must be short; anything
/// substantial should immediately hop onto an executor. I/O collaborators
/// use the same handle to schedule their completion callbacks.
///
/// The handle is cheap to clone; all clones refer to the same driver.
///
/// # Panics in callbacks
///
/// A panicking callback is caught, logged at `warn` level and discarded;
/// the driver keeps running.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<ReactorShared>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Reactor")
            .field("pending", &inner.timers.len())
            .field("shutdown", &inner.shutdown)
            .finish()
    }
}

impl Reactor {
    /// Starts a reactor with a named driver thread.
    ///
    /// The caller owns the join handle and is responsible for calling
    /// [`shutdown`][Self::shutdown] and joining it; executors embed the
    /// reactor and do exactly that when they stop.
    pub(crate) fn start(thread_name: &str) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(ReactorShared {
            inner: Mutex::new(ReactorInner {
                timers: BTreeMap::new(),
                last_discriminator: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let driver = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(thread_name.to_owned())
                .spawn(move || drive(&shared))
                .expect("failed to spawn reactor driver thread")
        };

        (Self { shared }, driver)
    }

    /// Schedules `callback` to run at `deadline`.
    pub fn schedule_at(
        &self,
        deadline: Instant,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerKey {
        let mut inner = self.shared.inner.lock();

        // Wrapping is fine, the discriminator only distinguishes entries
        // that share a deadline.
        inner.last_discriminator = inner.last_discriminator.wrapping_add(1);
        let key = TimerKey::new(deadline, inner.last_discriminator);

        inner.timers.insert(key, Box::new(callback));
        drop(inner);

        self.shared.wakeup.notify_all();
        key
    }

    /// Schedules `callback` to run once `delay` has elapsed.
    pub fn schedule_after(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerKey {
        self.schedule_at(Instant::now() + delay, callback)
    }

    /// Cancels a scheduled entry.
    ///
    /// Returns whether the entry was still pending. Canceling an entry that
    /// already fired (or was canceled before) is a no-op.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        self.shared.inner.lock().timers.remove(key).is_some()
    }

    pub(crate) fn shutdown(&self) {
        self.shared.inner.lock().shutdown = true;
        self.shared.wakeup.notify_all();
    }
}

fn drive(shared: &ReactorShared) {
    loop {
        let due = {
            let mut inner = shared.inner.lock();
            if inner.shutdown {
                return;
            }

            let now = Instant::now();
            let due = take_due(&mut inner, now);
            if due.is_empty() {
                match inner.timers.keys().next().map(TimerKey::deadline) {
                    Some(deadline) => {
                        let _ = shared.wakeup.wait_until(&mut inner, deadline);
                    }
                    None => shared.wakeup.wait(&mut inner),
                }
                continue;
            }

            due
        };

        for (_, callback) in due {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::warn!(target: "anyexec", "a reactor callback panicked; the panic was discarded");
            }
        }
    }
}

/// Splits off every entry whose deadline is at or before `now`.
fn take_due(inner: &mut ReactorInner, now: Instant) -> BTreeMap<TimerKey, TimerFn> {
    // `split_off` keeps keys >= the split point in the map, so nudge the
    // split point past `now` to also collect entries due exactly now.
    let adjusted = now.checked_add(Duration::from_nanos(1)).unwrap_or(now);
    let pending = inner.timers.split_off(&TimerKey::new(adjusted, 0));
    mem::replace(&mut inner.timers, pending)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn with_reactor(test: impl FnOnce(&Reactor)) {
        let (reactor, driver) = Reactor::start("test-reactor");
        test(&reactor);
        reactor.shutdown();
        driver.join().expect("driver must not panic");
    }

    #[test]
    fn fires_in_deadline_order() {
        with_reactor(|reactor| {
            let order = Arc::new(Mutex::new(Vec::new()));
            let done = Arc::new(crate::Event::new());

            let now = Instant::now();
            for (offset_ms, tag) in [(30u64, 'c'), (10, 'a'), (20, 'b')] {
                let order = Arc::clone(&order);
                let done = Arc::clone(&done);
                reactor.schedule_at(now + Duration::from_millis(offset_ms), move || {
                    order.lock().push(tag);
                    if tag == 'c' {
                        done.set();
                    }
                });
            }

            assert!(done.wait_for(Duration::from_secs(5)));
            assert_eq!(order.lock().as_slice(), &['a', 'b', 'c']);
        });
    }

    #[test]
    fn cancel_prevents_firing() {
        with_reactor(|reactor| {
            let fired = Arc::new(AtomicUsize::new(0));

            let key = {
                let fired = Arc::clone(&fired);
                reactor.schedule_after(Duration::from_millis(20), move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            };

            assert!(reactor.cancel(&key));
            thread::sleep(Duration::from_millis(60));
            assert_eq!(fired.load(Ordering::SeqCst), 0);

            // The entry is gone, a second cancel reports that.
            assert!(!reactor.cancel(&key));
        });
    }

    #[test]
    fn panicking_callback_does_not_kill_the_driver() {
        with_reactor(|reactor| {
            let done = Arc::new(crate::Event::new());

            reactor.schedule_after(Duration::from_millis(1), || panic!("boom"));
            {
                let done = Arc::clone(&done);
                reactor.schedule_after(Duration::from_millis(10), move || done.set());
            }

            assert!(done.wait_for(Duration::from_secs(5)));
        });
    }
}
