// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A one-shot, manual-reset wait primitive.
///
/// The event starts unsignaled. Once [`set`][Event::set] it stays signaled
/// forever and every current and future waiter is released. Setting an
/// already signaled event is a no-op.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, waking all waiters.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        if *signaled {
            return;
        }

        *signaled = true;
        self.cond.notify_all();
    }

    /// Blocks the calling thread until the event is signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    ///
    /// Returns whether the event was signaled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        let _ = self
            .cond
            .wait_while_for(&mut signaled, |signaled| !*signaled, timeout);
        *signaled
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Event: Send, Sync);
    }

    #[test]
    fn set_before_wait() {
        let event = Event::new();
        event.set();
        event.wait();
        assert!(event.wait_for(Duration::ZERO));
    }

    #[test]
    fn set_releases_waiter_on_other_thread() {
        let event = Arc::new(Event::new());

        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait())
        };

        thread::sleep(Duration::from_millis(10));
        event.set();
        waiter.join().expect("waiter must not panic");
    }

    #[test]
    fn wait_for_times_out() {
        let event = Event::new();

        let start = Instant::now();
        assert!(!event.wait_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn double_set_is_noop() {
        let event = Event::new();
        event.set();
        event.set();
        assert!(event.wait_for(Duration::ZERO));
    }
}
