// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyexec::{Executor, ThreadPoolExecutor};
use parking_lot::Mutex;
use tether::{
    AoContext, CallQueue, DelayedProperty, Error, all, all0, all2, all3, async_invoke, delay,
    invoke, make_ready_future, make_safe_callback, set_interval, set_timeout, to_thread,
};

fn pool() -> Arc<dyn Executor> {
    Arc::new(ThreadPoolExecutor::new(4))
}

#[test]
fn all_preserves_input_order() {
    let cx = AoContext::new(pool());

    let future = all(
        &cx,
        |_cx, value: u64| {
            to_thread(move || {
                // Later inputs finish earlier; order must still hold.
                thread::sleep(Duration::from_millis(40 - value * 10));
                value * 2
            })
        },
        vec![1, 2, 3],
    );

    assert_eq!(future.get().expect("all must succeed"), vec![2, 4, 6]);
}

#[test]
fn all_with_no_arguments_resolves_immediately() {
    let cx = AoContext::new(pool());
    let future = all(&cx, |_cx, value: i32| make_ready_future(value), Vec::new());

    assert_eq!(future.get().expect("empty all"), Vec::<i32>::new());
}

#[test]
fn all_fails_fast_and_cancels_peers() {
    let cx = AoContext::new(pool());
    let peer_ran = Arc::new(AtomicBool::new(false));

    let peer_flag = Arc::clone(&peer_ran);
    let future = all(
        &cx,
        move |cx, value: i32| {
            if value == 0 {
                return to_thread(|| -> i32 { panic!("operation failed") });
            }

            // A slow peer; its continuation must be cancelled, not run.
            let peer_flag = Arc::clone(&peer_flag);
            delay(cx, Duration::from_secs(10)).then(move |()| {
                peer_flag.store(true, Ordering::SeqCst);
                value
            })
        },
        vec![0, 1],
    );

    let started = Instant::now();
    assert!(matches!(future.get(), Err(Error::CallbackPanicked(_))));
    // Must not have waited for the slow peer.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!peer_ran.load(Ordering::SeqCst));
}

#[test]
fn all0_resolves_immediately() {
    let cx = AoContext::new(pool());
    all0(&cx).get().expect("zero-arity all");
}

#[test]
fn all2_joins_heterogeneous_results() {
    let cx = AoContext::new(pool());

    let future = all2(
        &cx,
        |_cx| to_thread(|| 7),
        |_cx| to_thread(|| "seven".to_owned()),
    );

    assert_eq!(future.get().expect("all2"), (7, "seven".to_owned()));
}

#[test]
fn all3_flattens_the_tuple() {
    let cx = AoContext::new(pool());

    let future = all3(
        &cx,
        |_cx| make_ready_future(1u8),
        |_cx| make_ready_future(2u16),
        |_cx| make_ready_future(3u32),
    );

    assert_eq!(future.get().expect("all3"), (1, 2, 3));
}

#[test]
fn all2_propagates_the_first_failure() {
    let cx = AoContext::new(pool());

    let future = all2(
        &cx,
        |_cx| to_thread(|| -> i32 { panic!("left failed") }),
        |cx| delay(cx, Duration::from_secs(10)).then(|()| 1),
    );

    assert!(matches!(future.get(), Err(Error::CallbackPanicked(_))));
}

#[test]
fn call_queue_executes_in_push_order() {
    let cx = AoContext::new(pool());
    let mut queue = CallQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut results = Vec::new();
    for n in 0..10 {
        let log = Arc::clone(&log);
        results.push(queue.push(&cx, move || {
            log.lock().push(n);
            n
        }));
    }

    for (n, future) in results.into_iter().enumerate() {
        assert_eq!(future.get().expect("call must succeed"), n);
    }
    assert_eq!(log.lock().as_slice(), (0..10).collect::<Vec<_>>());
}

#[test]
fn call_queue_failure_does_not_stop_the_queue() {
    let cx = AoContext::new(pool());
    let mut queue = CallQueue::new();

    let failing = queue.push(&cx, || -> i32 { panic!("call failed") });
    let following = queue.push(&cx, || 42);

    assert!(matches!(failing.get(), Err(Error::CallbackPanicked(_))));
    assert_eq!(following.get().expect("queue keeps going"), 42);
}

#[test]
fn safe_callback_posts_into_the_context() {
    let cx = AoContext::new(pool());

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let callback = make_safe_callback(&cx, move |value: i32| sink.lock().push(value));

    let caller = {
        let callback = callback.clone();
        thread::spawn(move || {
            for n in 0..5 {
                callback.call(n).expect("context is open");
            }
        })
    };
    caller.join().expect("caller must not panic");

    invoke(&cx, || ()).expect("drain the context");
    assert_eq!(received.lock().as_slice(), &[0, 1, 2, 3, 4]);
}

#[test]
fn safe_callback_fails_after_close() {
    let cx = AoContext::new(pool());
    let callback = make_safe_callback(&cx, |_value: i32| ());

    cx.close();

    assert_eq!(callback.call(1), Err(Error::ContextClosed));
}

#[test]
fn invoke_returns_the_result() {
    let cx = AoContext::new(pool());
    assert_eq!(invoke(&cx, || 2 + 2).expect("invoke"), 4);
}

#[test]
fn invoke_from_inside_the_context_runs_inline() {
    let cx = AoContext::new(pool());
    let cx_ref = cx.handle();

    let nested = invoke(&cx, move || {
        // A blocking round-trip from inside the context would deadlock if
        // it were posted; inline execution makes it legal.
        invoke(&cx_ref, || 21).expect("inner invoke") * 2
    })
    .expect("outer invoke");

    assert_eq!(nested, 42);
}

#[test]
fn async_invoke_delivers_through_a_future() {
    let cx = AoContext::new(pool());
    let future = async_invoke(&cx, || "hello".to_owned());

    assert_eq!(future.get().expect("async invoke"), "hello");
}

#[test]
fn delayed_property_applies_offers() {
    let property = Arc::new(DelayedProperty::new(0));
    assert_eq!(property.current_value(), 0);
    assert!(!property.has_new_value());

    let mut accepted = property.set_value(5);
    assert!(property.has_new_value());
    assert!(property.wait_new_value_for(Duration::from_millis(10)));

    property.apply_new_value(|value| {
        assert_eq!(*value, 5);
        Ok(())
    });

    accepted.wait();
    assert_eq!(property.current_value(), 5);
    assert!(!property.has_new_value());
}

#[test]
fn delayed_property_supersedes_pending_offers() {
    let property = DelayedProperty::new(0);

    let superseded = property.set_value(1);
    let current = property.set_value(2);

    assert_eq!(superseded.get(), Err(Error::OperationCancelled));

    property.apply();
    current.get().expect("latest offer wins");
    assert_eq!(property.current_value(), 2);
}

#[test]
fn delayed_property_rejected_offers_leave_the_value() {
    let property = DelayedProperty::new(7);

    let offer = property.set_value(8);
    property.apply_new_value(|_value| Err(Error::other(std::io::Error::other("rejected"))));

    assert!(matches!(offer.get(), Err(Error::Other(_))));
    assert_eq!(property.current_value(), 7);
}

#[test]
fn delay_resolves_after_the_duration() {
    let cx = AoContext::new(pool());

    let started = Instant::now();
    delay(&cx, Duration::from_millis(50))
        .get()
        .expect("delay must resolve");

    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn delay_is_cancelled_by_context_close() {
    let cx = AoContext::new(pool());

    let future = delay(&cx, Duration::from_secs(30));
    cx.close();

    assert_eq!(future.get(), Err(Error::OperationCancelled));
}

#[test]
fn set_timeout_fires_inside_the_context() {
    let cx = AoContext::new(pool());

    let fired = Arc::new(AtomicBool::new(false));
    let in_context = Arc::new(AtomicBool::new(false));
    {
        let cx_ref = cx.handle();
        let fired = Arc::clone(&fired);
        let in_context = Arc::clone(&in_context);
        set_timeout(&cx, Duration::from_millis(20), move || {
            in_context.store(cx_ref.in_this_thread(), Ordering::SeqCst);
            fired.store(true, Ordering::SeqCst);
        })
        .expect("open context accepts timers");
    }

    thread::sleep(Duration::from_millis(200));
    assert!(fired.load(Ordering::SeqCst));
    assert!(in_context.load(Ordering::SeqCst));
}

#[test]
fn timers_need_a_reactor_backed_executor() {
    // An executor that runs everything on the calling thread and exposes
    // no reactor: fine for plain work, but timers have nothing to tick
    // them.
    struct CallerThreadExecutor;

    impl anyexec::Executor for CallerThreadExecutor {
        fn exec(&self, work: anyexec::Work, _mode: anyexec::ExecMode) {
            work();
        }
    }

    let cx = AoContext::new(Arc::new(CallerThreadExecutor));

    assert_eq!(invoke(&cx, || 5).expect("plain work runs"), 5);
    assert!(matches!(
        set_timeout(&cx, Duration::from_millis(1), || ()),
        Err(Error::Executor(anyexec::Error::NoReactor))
    ));
}

#[test]
fn set_timeout_on_closed_context_fails() {
    let cx = AoContext::new(pool());
    cx.close();

    assert!(matches!(
        set_timeout(&cx, Duration::from_millis(1), || ()),
        Err(Error::ContextClosed)
    ));
}

#[test]
fn set_interval_ticks_until_told_to_stop() {
    let cx = AoContext::new(pool());

    let ticks = Arc::new(AtomicUsize::new(0));
    {
        let ticks = Arc::clone(&ticks);
        set_interval(&cx, Duration::from_millis(10), move || {
            ticks.fetch_add(1, Ordering::SeqCst) + 1 < 3
        })
        .expect("open context accepts timers");
    }

    thread::sleep(Duration::from_millis(500));
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
}

#[test]
fn set_interval_stops_when_the_context_closes() {
    let cx = AoContext::new(pool());

    let ticks = Arc::new(AtomicUsize::new(0));
    {
        let ticks = Arc::clone(&ticks);
        set_interval(&cx, Duration::from_millis(10), move || {
            ticks.fetch_add(1, Ordering::SeqCst);
            true
        })
        .expect("open context accepts timers");
    }

    thread::sleep(Duration::from_millis(100));
    cx.close();
    let after_close = ticks.load(Ordering::SeqCst);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::SeqCst), after_close);
}
