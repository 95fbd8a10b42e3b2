// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::UnsafeCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::Error;

pub(crate) const HAS_RESULT: u8 = 1 << 0;
pub(crate) const HAS_CALLBACK: u8 = 1 << 1;

/// Which side completed the rendezvous, i.e. which flag was set second.
///
/// Context-bound continuations use this to pick a dispatch mode: a callback
/// installed after the result already landed (`Trigger::Callback`) prefers
/// inline execution, because the installing thread is just attaching a
/// continuation to an already-ready future and a queue hop would be pure
/// latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// The result arrived second; the producer's thread fires the callback.
    Result,
    /// The callback was installed second, after the result was present.
    Callback,
}

/// A continuation installed on a [`FutureState`].
pub(crate) trait StateCallback<T>: Send {
    fn future_ready(self: Box<Self>, state: &Arc<FutureState<T>>, trigger: Trigger);
}

/// The shared cell between one producer ([`Promise`][crate::Promise]) and
/// one continuation point.
///
/// The rendezvous is lock-free: a two-bit flag word tracks which of the two
/// sides (result, callback) has arrived, and the side that sets the
/// *second* flag fires the callback, exactly once, on its own thread.
pub(crate) struct FutureState<T> {
    flags: AtomicU8,
    result: UnsafeCell<Option<Result<T, Error>>>,
    callback: UnsafeCell<Option<Box<dyn StateCallback<T>>>>,
}

// SAFETY: the cells are guarded by the flag-word protocol. `result` is
// written once by the single producer before it publishes HAS_RESULT with
// release ordering, and read only after HAS_RESULT was observed with
// acquire ordering, by the single consumer. `callback` is written once by
// the single installer before it publishes HAS_CALLBACK, and taken only by
// the one thread that performs the completing flag transition.
unsafe impl<T: Send> Send for FutureState<T> {}
// SAFETY: see above; no shared `&self` access touches the cells outside the
// protocol.
unsafe impl<T: Send> Sync for FutureState<T> {}

impl<T: Send + 'static> FutureState<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flags: AtomicU8::new(0),
            result: UnsafeCell::new(None),
            callback: UnsafeCell::new(None),
        })
    }

    pub fn has_result(&self) -> bool {
        self.flags.load(Ordering::Acquire) & HAS_RESULT != 0
    }

    /// Stores the result and publishes HAS_RESULT. Must be called at most
    /// once; the promise layer enforces that.
    pub fn set_result(self: &Arc<Self>, result: Result<T, Error>) {
        debug_assert!(!self.has_result(), "a future state settles only once");

        // SAFETY: we are the single producer and the flag is not yet
        // published, so nothing else accesses the cell.
        unsafe {
            *self.result.get() = Some(result);
        }

        self.publish(HAS_RESULT);
    }

    /// Settles the state with the outcome of `body`, capturing a panic as
    /// [`Error::CallbackPanicked`].
    pub fn fulfill_with(self: &Arc<Self>, body: impl FnOnce() -> T) {
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(value) => self.set_result(Ok(value)),
            Err(payload) => self.set_result(Err(Error::from_panic(payload))),
        }
    }

    /// Like [`fulfill_with`][Self::fulfill_with] for fallible bodies.
    pub fn fulfill_try_with(self: &Arc<Self>, body: impl FnOnce() -> Result<T, Error>) {
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => self.set_result(result),
            Err(payload) => self.set_result(Err(Error::from_panic(payload))),
        }
    }

    /// Installs the continuation and publishes HAS_CALLBACK. Must be called
    /// at most once; the future handles enforce that by consuming
    /// themselves on attach.
    pub fn install_callback(self: &Arc<Self>, callback: Box<dyn StateCallback<T>>) {
        debug_assert!(
            self.flags.load(Ordering::Acquire) & HAS_CALLBACK == 0,
            "a future state accepts only one continuation"
        );

        // SAFETY: we are the single installer and the flag is not yet
        // published, so nothing else accesses the cell.
        unsafe {
            *self.callback.get() = Some(callback);
        }

        self.publish(HAS_CALLBACK);
    }

    /// Moves the result out. May only be called after `has_result()` is
    /// observed, by the single consuming party.
    pub fn take_result(&self) -> Result<T, Error> {
        debug_assert!(self.has_result(), "no result to take");

        // SAFETY: HAS_RESULT was observed with acquire ordering, so the
        // producer's write is visible, and the single consumer takes the
        // value exactly once.
        unsafe { (*self.result.get()).take() }.expect("a settled result is taken only once")
    }

    /// Sets `flag` and, when that completes the pair, fires the callback
    /// from this thread.
    fn publish(self: &Arc<Self>, flag: u8) {
        let mut current = self.flags.load(Ordering::Acquire);
        if current == 0 {
            match self
                .flags
                .compare_exchange(0, flag, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return, // Only one flag is set so far.
                Err(observed) => current = observed,
            }
        }

        debug_assert_eq!(current | flag, HAS_RESULT | HAS_CALLBACK);
        self.flags
            .store(HAS_RESULT | HAS_CALLBACK, Ordering::Relaxed);

        // Both sides have arrived and we performed the completing
        // transition, so the callback is ours to fire.
        //
        // SAFETY: the installer published the callback before HAS_CALLBACK
        // and we observed that flag with acquire ordering.
        let callback = unsafe { (*self.callback.get()).take() }
            .expect("the completing transition finds the callback installed");

        let trigger = if flag == HAS_RESULT {
            Trigger::Result
        } else {
            Trigger::Callback
        };
        callback.future_ready(self, trigger);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    struct Recorder {
        fired: Arc<AtomicUsize>,
        trigger: Arc<parking_lot::Mutex<Option<Trigger>>>,
    }

    impl StateCallback<i32> for Recorder {
        fn future_ready(self: Box<Self>, state: &Arc<FutureState<i32>>, trigger: Trigger) {
            assert!(state.has_result());
            self.fired.fetch_add(1, Ordering::SeqCst);
            *self.trigger.lock() = Some(trigger);
        }
    }

    fn recorder() -> (
        Box<Recorder>,
        Arc<AtomicUsize>,
        Arc<parking_lot::Mutex<Option<Trigger>>>,
    ) {
        let fired = Arc::new(AtomicUsize::new(0));
        let trigger = Arc::new(parking_lot::Mutex::new(None));
        (
            Box::new(Recorder {
                fired: Arc::clone(&fired),
                trigger: Arc::clone(&trigger),
            }),
            fired,
            trigger,
        )
    }

    #[test]
    fn result_then_callback_fires_with_callback_trigger() {
        let state = FutureState::new();
        let (callback, fired, trigger) = recorder();

        state.set_result(Ok(5));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        state.install_callback(callback);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*trigger.lock(), Some(Trigger::Callback));
    }

    #[test]
    fn callback_then_result_fires_with_result_trigger() {
        let state = FutureState::new();
        let (callback, fired, trigger) = recorder();

        state.install_callback(callback);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        state.set_result(Ok(5));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*trigger.lock(), Some(Trigger::Result));
    }

    #[test]
    fn concurrent_install_and_settle_fire_exactly_once() {
        for _ in 0..200 {
            let state = FutureState::new();
            let (callback, fired, _trigger) = recorder();

            let producer = {
                let state = Arc::clone(&state);
                thread::spawn(move || state.set_result(Ok(1)))
            };
            let installer = {
                let state = Arc::clone(&state);
                thread::spawn(move || state.install_callback(callback))
            };

            producer.join().expect("producer must not panic");
            installer.join().expect("installer must not panic");

            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn fulfill_with_captures_panics() {
        let state = FutureState::<i32>::new();
        state.fulfill_with(|| panic!("kaboom"));

        assert!(state.has_result());
        assert_eq!(
            state.take_result(),
            Err(Error::CallbackPanicked("kaboom".to_owned()))
        );
    }
}
