// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyexec::{Executor, ThreadPoolExecutor};
use overseer::{ConsumeStatus, Consumer, ObservableState, Producer, StateObserver};
use parking_lot::Mutex;
use tether::{Error, make_failed_future, make_ready_future};

fn pool() -> Arc<dyn Executor> {
    Arc::new(ThreadPoolExecutor::new(2))
}

struct RecordingConsumer {
    log: Arc<Mutex<Vec<ObservableState<usize>>>>,
}

impl Consumer<ObservableState<usize>> for RecordingConsumer {
    fn consume(&mut self, value: &ObservableState<usize>) -> ConsumeStatus {
        self.log.lock().push(value.clone());
        ConsumeStatus::Ok
    }
}

fn wait_until(probe: impl Fn() -> bool) {
    for _ in 0..500 {
        if probe() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }

    panic!("the observed condition never became true");
}

#[test]
fn state_starts_uninitialized() {
    // A poll period far beyond the test's lifetime: the first probe never
    // fires, so only the initial state is observable.
    let observer = StateObserver::with_poll_period(
        |_value: usize| make_ready_future(()),
        || make_ready_future(0usize),
        pool(),
        Duration::from_secs(3600),
    );

    let state = observer.state();
    assert_eq!(state.error(), Some(&Error::StateUninitialized));
    assert!(matches!(state.into_result(), Err(Error::StateUninitialized)));
}

#[test]
fn polling_picks_up_the_external_state() {
    let source = Arc::new(AtomicUsize::new(7));

    let getter_source = Arc::clone(&source);
    let observer = StateObserver::with_poll_period(
        |_value: usize| make_ready_future(()),
        move || make_ready_future(getter_source.load(Ordering::SeqCst)),
        pool(),
        Duration::from_millis(10),
    );

    wait_until(|| observer.state().value() == Some(&7));

    // The source changes; the next poll observes it.
    source.store(8, Ordering::SeqCst);
    wait_until(|| observer.state().value() == Some(&8));
}

#[test]
fn consumers_see_each_change_once() {
    let source = Arc::new(AtomicUsize::new(1));
    let log = Arc::new(Mutex::new(Vec::new()));

    let getter_source = Arc::clone(&source);
    let observer = StateObserver::with_poll_period(
        |_value: usize| make_ready_future(()),
        move || make_ready_future(getter_source.load(Ordering::SeqCst)),
        pool(),
        Duration::from_millis(10),
    );
    observer.attach_consumer(Box::new(RecordingConsumer {
        log: Arc::clone(&log),
    }));

    wait_until(|| observer.state().value() == Some(&1));
    // Several polls with an unchanged source must not re-notify.
    thread::sleep(Duration::from_millis(100));

    source.store(2, Ordering::SeqCst);
    wait_until(|| observer.state().value() == Some(&2));

    let observed: Vec<_> = log
        .lock()
        .iter()
        .filter_map(|state| state.value().copied())
        .collect();
    assert_eq!(observed, vec![1, 2]);
}

#[test]
fn getter_failures_become_error_states() {
    let observer = StateObserver::with_poll_period(
        |_value: usize| make_ready_future(()),
        || make_failed_future::<usize>(Error::other(std::io::Error::other("probe failed"))),
        pool(),
        Duration::from_millis(10),
    );

    wait_until(|| observer.state().has_error() && observer.state().error() != Some(&Error::StateUninitialized));
    assert!(matches!(
        observer.state().error(),
        Some(Error::Other(_))
    ));
}

#[test]
fn set_state_publishes_and_invokes_the_setter() {
    let source = Arc::new(AtomicUsize::new(3));
    let setter_called = Arc::new(AtomicBool::new(false));

    let setter_source = Arc::clone(&source);
    let setter_flag = Arc::clone(&setter_called);
    let getter_source = Arc::clone(&source);

    let observer = StateObserver::with_poll_period(
        move |value: usize| {
            setter_source.store(value, Ordering::SeqCst);
            setter_flag.store(true, Ordering::SeqCst);
            make_ready_future(())
        },
        move || make_ready_future(getter_source.load(Ordering::SeqCst)),
        pool(),
        Duration::from_millis(10),
    );

    wait_until(|| observer.state().value() == Some(&3));

    observer.set_state(9);

    // Published optimistically, then pushed through the setter.
    assert_eq!(observer.state().value(), Some(&9));
    wait_until(|| setter_called.load(Ordering::SeqCst));
    wait_until(|| source.load(Ordering::SeqCst) == 9);

    // Polling continues afterwards and agrees with the source.
    wait_until(|| observer.state().value() == Some(&9));
}
