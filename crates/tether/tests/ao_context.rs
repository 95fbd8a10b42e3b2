// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyexec::{Event, ExecMode, Executor, ThreadPoolExecutor};
use parking_lot::Mutex;
use tether::{AoContext, CloseHandler, Error, make_ready_future};

struct RecordingHandler {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl CloseHandler for RecordingHandler {
    fn on_close(&self) {
        self.log.lock().push(self.name);
    }
}

fn pool() -> Arc<dyn Executor> {
    Arc::new(ThreadPoolExecutor::new(4))
}

#[test]
fn work_runs_serially_in_submission_order() {
    let cx = AoContext::new(pool());

    let active = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Event::new());

    for n in 0..100 {
        let active = Arc::clone(&active);
        let log = Arc::clone(&log);
        let done = Arc::clone(&done);
        cx.exec(
            move || {
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                active.fetch_sub(1, Ordering::SeqCst);
                log.lock().push(n);
                if n == 99 {
                    done.set();
                }
            },
            ExecMode::Queued,
        );
    }

    assert!(done.wait_for(Duration::from_secs(10)));
    assert_eq!(log.lock().as_slice(), (0..100).collect::<Vec<_>>());
}

#[test]
fn work_after_close_is_dropped() {
    let cx = AoContext::new(pool());
    cx.close();

    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = Arc::clone(&ran);
        cx.exec(move || ran.store(true, Ordering::SeqCst), ExecMode::Queued);
    }

    thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn close_is_idempotent() {
    let cx = AoContext::new(pool());

    let log = Arc::new(Mutex::new(Vec::new()));
    cx.add_close_handler(Arc::new(RecordingHandler {
        name: "only",
        log: Arc::clone(&log),
    }))
    .expect("open context accepts handlers");

    cx.close();
    cx.close();

    assert_eq!(log.lock().as_slice(), &["only"]);
    assert!(!cx.is_open());
}

#[test]
fn close_handlers_fire_once_in_lifo_order() {
    let cx = AoContext::new(pool());
    let log = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second", "third"] {
        cx.add_close_handler(Arc::new(RecordingHandler {
            name,
            log: Arc::clone(&log),
        }))
        .expect("open context accepts handlers");
    }

    cx.close();
    assert_eq!(log.lock().as_slice(), &["third", "second", "first"]);
}

#[test]
fn removed_handlers_do_not_fire() {
    let cx = AoContext::new(pool());
    let log = Arc::new(Mutex::new(Vec::new()));

    let id = cx
        .add_close_handler(Arc::new(RecordingHandler {
            name: "removed",
            log: Arc::clone(&log),
        }))
        .expect("open context accepts handlers");
    cx.add_close_handler(Arc::new(RecordingHandler {
        name: "kept",
        log: Arc::clone(&log),
    }))
    .expect("open context accepts handlers");

    cx.remove_close_handler(id);
    cx.close();

    assert_eq!(log.lock().as_slice(), &["kept"]);
}

#[test]
fn attaching_to_a_closing_context_fails() {
    let cx = AoContext::new(pool());
    cx.close();

    let log = Arc::new(Mutex::new(Vec::new()));
    let result = cx.add_close_handler(Arc::new(RecordingHandler {
        name: "late",
        log: Arc::clone(&log),
    }));

    assert!(matches!(result, Err(Error::ContextClosed)));
    assert!(matches!(cx.new_child(), Err(Error::ContextClosed)));
}

#[test]
fn children_close_with_the_parent() {
    let parent = AoContext::new(pool());
    let child = parent.new_child().expect("open parent accepts children");

    let log = Arc::new(Mutex::new(Vec::new()));
    child
        .add_close_handler(Arc::new(RecordingHandler {
            name: "child-handler",
            log: Arc::clone(&log),
        }))
        .expect("open context accepts handlers");

    parent.close();

    assert!(!child.is_open());
    assert_eq!(log.lock().as_slice(), &["child-handler"]);
}

#[test]
fn children_share_the_parents_serialization_domain() {
    let parent = AoContext::new(pool());
    let child = parent.new_child().expect("open parent accepts children");

    let active = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Event::new());
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        for target in [&parent, &child] {
            let active = Arc::clone(&active);
            let done = Arc::clone(&done);
            let count = Arc::clone(&count);
            target.exec(
                move || {
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    active.fetch_sub(1, Ordering::SeqCst);
                    if count.fetch_add(1, Ordering::SeqCst) + 1 == 100 {
                        done.set();
                    }
                },
                ExecMode::Queued,
            );
        }
    }

    assert!(done.wait_for(Duration::from_secs(10)));
}

#[test]
fn in_this_thread_is_visible_only_inside_work() {
    let cx = AoContext::new(pool());
    assert!(!cx.in_this_thread());

    let observed = Arc::new(AtomicBool::new(false));
    let done = Arc::new(Event::new());
    {
        let cx_ref = cx.handle();
        let observed = Arc::clone(&observed);
        let done = Arc::clone(&done);
        cx.exec(
            move || {
                observed.store(cx_ref.in_this_thread(), Ordering::SeqCst);
                done.set();
            },
            ExecMode::Queued,
        );
    }

    assert!(done.wait_for(Duration::from_secs(5)));
    assert!(observed.load(Ordering::SeqCst));
}

#[test]
fn close_waits_for_running_work() {
    let cx = AoContext::new(pool());

    let started = Arc::new(Event::new());
    let finished = Arc::new(AtomicBool::new(false));
    {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        cx.exec(
            move || {
                started.set();
                thread::sleep(Duration::from_millis(100));
                finished.store(true, Ordering::SeqCst);
            },
            ExecMode::Queued,
        );
    }

    assert!(started.wait_for(Duration::from_secs(5)));
    cx.close();

    // Close must not return while the work item is still running.
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn close_from_inside_own_work_does_not_deadlock() {
    let cx = Arc::new(AoContext::new(pool()));

    let done = Arc::new(Event::new());
    {
        let cx2 = Arc::clone(&cx);
        let done = Arc::clone(&done);
        cx.exec(
            move || {
                cx2.close();
                done.set();
            },
            ExecMode::Queued,
        );
    }

    assert!(done.wait_for(Duration::from_secs(5)));
    cx.close();
    assert!(!cx.is_open());
}

#[test]
fn close_from_an_inline_continuation_does_not_deadlock() {
    let cx = Arc::new(AoContext::new(pool()));

    let closed_inline = Arc::new(AtomicBool::new(false));
    let done = Arc::new(Event::new());
    {
        let cx2 = Arc::clone(&cx);
        let cx_ref = cx.handle();
        let closed_inline = Arc::clone(&closed_inline);
        let done = Arc::clone(&done);
        cx.exec(
            move || {
                // Ready at attach time and attached from inside the
                // context: the continuation runs inline, nested in this
                // work item. Closing the context from it must not wait on
                // the reservations this thread itself holds.
                let flag = Arc::clone(&closed_inline);
                let _ = make_ready_future(()).via(&cx_ref).then(move |()| {
                    cx2.close();
                    flag.store(!cx2.is_open(), Ordering::SeqCst);
                });

                done.set();
            },
            ExecMode::Queued,
        );
    }

    assert!(done.wait_for(Duration::from_secs(5)));
    assert!(closed_inline.load(Ordering::SeqCst));
    assert!(!cx.is_open());
}

#[test]
fn close_from_inside_a_close_handler_does_not_deadlock() {
    struct ReentrantClose {
        cx: Arc<AoContext>,
        fired: Arc<AtomicUsize>,
    }

    impl CloseHandler for ReentrantClose {
        fn on_close(&self) {
            self.fired.fetch_add(1, Ordering::SeqCst);
            self.cx.close();
        }
    }

    let cx = Arc::new(AoContext::new(pool()));
    let fired = Arc::new(AtomicUsize::new(0));

    cx.add_close_handler(Arc::new(ReentrantClose {
        cx: Arc::clone(&cx),
        fired: Arc::clone(&fired),
    }))
    .expect("open context accepts handlers");

    cx.close();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_parent_and_child_close_terminate() {
    for _ in 0..50 {
        let parent = Arc::new(AoContext::new(pool()));
        let child = Arc::new(parent.new_child().expect("open parent accepts children"));

        let fired = Arc::new(AtomicUsize::new(0));
        child
            .add_close_handler(Arc::new(RecordingCounter {
                fired: Arc::clone(&fired),
            }))
            .expect("open context accepts handlers");

        let close_parent = {
            let parent = Arc::clone(&parent);
            thread::spawn(move || parent.close())
        };
        let close_child = {
            let child = Arc::clone(&child);
            thread::spawn(move || child.close())
        };

        close_parent.join().expect("parent close must not panic");
        close_child.join().expect("child close must not panic");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!parent.is_open());
        assert!(!child.is_open());
    }
}

struct RecordingCounter {
    fired: Arc<AtomicUsize>,
}

impl CloseHandler for RecordingCounter {
    fn on_close(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn concurrent_double_close_fires_handlers_once() {
    for _ in 0..50 {
        let cx = Arc::new(AoContext::new(pool()));
        let fired = Arc::new(AtomicUsize::new(0));

        cx.add_close_handler(Arc::new(RecordingCounter {
            fired: Arc::clone(&fired),
        }))
        .expect("open context accepts handlers");

        let closers: Vec<_> = (0..2)
            .map(|_| {
                let cx = Arc::clone(&cx);
                thread::spawn(move || cx.close())
            })
            .collect();
        for closer in closers {
            closer.join().expect("close must not panic");
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn start_cancellable_unregisters_on_failed_start() {
    let cx = AoContext::new(pool());
    let log = Arc::new(Mutex::new(Vec::new()));

    let result = cx.start_cancellable(
        || Err(Error::other(std::io::Error::other("start failed"))),
        Arc::new(RecordingHandler {
            name: "aborted",
            log: Arc::clone(&log),
        }),
    );
    assert!(result.is_err());

    cx.start_cancellable(
        || Ok(()),
        Arc::new(RecordingHandler {
            name: "started",
            log: Arc::clone(&log),
        }),
    )
    .expect("successful start keeps the handler");

    cx.close();
    assert_eq!(log.lock().as_slice(), &["started"]);
}

#[test]
fn panicking_close_handler_does_not_stop_the_close() {
    struct PanickingHandler;

    impl CloseHandler for PanickingHandler {
        fn on_close(&self) {
            panic!("handler exploded");
        }
    }

    let cx = AoContext::new(pool());
    let log = Arc::new(Mutex::new(Vec::new()));

    cx.add_close_handler(Arc::new(RecordingHandler {
        name: "survivor",
        log: Arc::clone(&log),
    }))
    .expect("open context accepts handlers");
    cx.add_close_handler(Arc::new(PanickingHandler))
        .expect("open context accepts handlers");

    cx.close();
    assert_eq!(log.lock().as_slice(), &["survivor"]);
}
