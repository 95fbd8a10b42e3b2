// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::{ExecMode, Executor, Reactor, Result, SequenceExecutor, Work, run_work};

struct SingleCore {
    queue: Mutex<VecDeque<Work>>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl SingleCore {
    fn worker_loop(&self) {
        loop {
            let work = {
                let mut queue = self.queue.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }

                    match queue.pop_front() {
                        Some(work) => break work,
                        None => self.available.wait(&mut queue),
                    }
                }
            };

            run_work(work);
        }
    }
}

/// An executor backed by exactly one worker thread.
///
/// One thread can never run two items at once, so this is a
/// [`SequenceExecutor`]: submitted work runs serially in submission order.
/// Work submitted with [`ExecMode::InlineIfPossible`] from the worker thread
/// itself runs synchronously.
pub struct ThreadExecutor {
    core: Arc<SingleCore>,
    reactor: Reactor,
    thread_id: ThreadId,
    worker: Option<JoinHandle<()>>,
    reactor_driver: Option<JoinHandle<()>>,
}

impl fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadExecutor")
            .field("thread_id", &self.thread_id)
            .field("queued", &self.core.queue.lock().len())
            .finish_non_exhaustive()
    }
}

impl ThreadExecutor {
    pub fn new() -> Self {
        Self::with_name("anyexec-thread")
    }

    /// Creates an executor whose worker thread carries `name`.
    pub fn with_name(name: &str) -> Self {
        let core = Arc::new(SingleCore {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker = {
            let core = Arc::clone(&core);
            thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || core.worker_loop())
                .expect("failed to spawn executor worker thread")
        };

        let thread_id = worker.thread().id();
        let (reactor, reactor_driver) = Reactor::start(&format!("{name}-reactor"));

        Self {
            core,
            reactor,
            thread_id,
            worker: Some(worker),
            reactor_driver: Some(reactor_driver),
        }
    }

    /// The id of the worker thread, for callers asserting thread affinity.
    pub fn id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether the calling thread is the worker thread.
    pub fn in_executor_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ThreadExecutor {
    fn exec(&self, work: Work, mode: ExecMode) {
        if mode == ExecMode::InlineIfPossible && self.in_executor_thread() {
            // Already inside the current item on the only thread; running
            // inline cannot break the sequence guarantee.
            run_work(work);
            return;
        }

        let mut queue = self.core.queue.lock();
        if self.core.shutdown.load(Ordering::Acquire) {
            return;
        }
        queue.push_back(work);
        drop(queue);

        self.core.available.notify_one();
    }

    fn reactor(&self) -> Result<Reactor> {
        Ok(self.reactor.clone())
    }

    fn to_sequence(self: Arc<Self>) -> Option<Arc<dyn SequenceExecutor>> {
        Some(self)
    }
}

impl SequenceExecutor for ThreadExecutor {}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::Release);
        self.core.available.notify_all();

        // The last reference can be released from inside a work item;
        // joining would then wait on the current thread. The worker still
        // exits through the shutdown flag.
        if let Some(worker) = self.worker.take() {
            if !self.in_executor_thread() {
                let _ = worker.join();
            }
        }

        self.reactor.shutdown();
        if let Some(driver) = self.reactor_driver.take() {
            let _ = driver.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::Event;

    #[test]
    fn work_runs_on_the_worker_thread() {
        let executor = ThreadExecutor::new();
        let expected = executor.id();
        let done = Arc::new(Event::new());

        {
            let done = Arc::clone(&done);
            executor.exec(
                Box::new(move || {
                    assert_eq!(thread::current().id(), expected);
                    done.set();
                }),
                ExecMode::Queued,
            );
        }

        assert!(done.wait_for(Duration::from_secs(5)));
    }

    #[test]
    fn work_runs_in_submission_order() {
        let executor = ThreadExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Event::new());

        for n in 0..100 {
            let log = Arc::clone(&log);
            let done = Arc::clone(&done);
            executor.exec(
                Box::new(move || {
                    log.lock().push(n);
                    if n == 99 {
                        done.set();
                    }
                }),
                ExecMode::Queued,
            );
        }

        assert!(done.wait_for(Duration::from_secs(5)));
        assert_eq!(log.lock().as_slice(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn is_usable_as_sequence_executor() {
        let executor: Arc<dyn Executor> = Arc::new(ThreadExecutor::new());
        assert!(executor.to_sequence().is_some());
    }
}
