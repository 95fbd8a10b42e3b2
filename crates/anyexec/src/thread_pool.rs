// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::{ExecMode, Executor, Reactor, Result, Work, run_work};

/// Process-unique id of a pool, used for the "am I on one of this pool's
/// threads" check that backs inline execution.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

struct PoolCore {
    id: u64,
    queue: Mutex<VecDeque<Work>>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl PoolCore {
    fn worker_loop(&self) {
        CURRENT_POOL.set(self.id);

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

/// An [`Executor`] backed by a fixed set of worker threads sharing one work
/// queue and one [`Reactor`].
///
/// Up to `thread_count` work items run in parallel. Work submitted with
/// [`ExecMode::InlineIfPossible`] runs synchronously when the caller is
/// already on one of the pool's worker threads.
///
/// Dropping the pool stops the workers; work still sitting in the queue at
/// that point is discarded.
pub struct ThreadPoolExecutor {
    core: Arc<PoolCore>,
    reactor: Reactor,
    workers: Vec<JoinHandle<()>>,
    reactor_driver: Option<JoinHandle<()>>,
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("threads", &self.workers.len())
            .field("queued", &self.core.queue.lock().len())
            .finish_non_exhaustive()
    }
}

impl ThreadPoolExecutor {
    pub fn new(thread_count: usize) -> Self {
        Self::with_name(thread_count, "anyexec-pool")
    }

    /// Creates a pool whose worker threads carry `name`.
    pub fn with_name(thread_count: usize, name: &str) -> Self {
        assert!(thread_count > 0, "a thread pool needs at least one thread");

        let core = Arc::new(PoolCore {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..thread_count)
            .map(|n| {
                let core = Arc::clone(&core);
                thread::Builder::new()
                    .name(format!("{name}-{n}"))
                    .spawn(move || core.worker_loop())
                    .expect("failed to spawn pool worker thread")
            })
            .collect();

        let (reactor, reactor_driver) = Reactor::start(&format!("{name}-reactor"));

        Self {
            core,
            reactor,
            workers,
            reactor_driver: Some(reactor_driver),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// The process-wide pool, sized to the hardware concurrency and created
    /// on first use.
    pub fn default_pool() -> Arc<Self> {
        static DEFAULT: Lazy<Arc<ThreadPoolExecutor>> = Lazy::new(|| {
            let threads = thread::available_parallelism().map_or(1, usize::from);
            Arc::new(ThreadPoolExecutor::with_name(threads, "anyexec-default"))
        });

        Arc::clone(&DEFAULT)
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn in_pool_thread(&self) -> bool {
        CURRENT_POOL.get() == self.core.id
    }
}

impl Executor for ThreadPoolExecutor {
    fn exec(&self, work: Work, mode: ExecMode) {
        if mode == ExecMode::InlineIfPossible && self.in_pool_thread() {
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
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::Release);
        self.core.available.notify_all();

        // The last reference can be released from inside a work item (e.g.
        // a context closing from within its own work); joining would then
        // wait on the current thread. The workers still exit through the
        // shutdown flag, they are just not waited for.
        let joinable = !self.in_pool_thread();
        for worker in self.workers.drain(..) {
            if joinable {
                let _ = worker.join();
            }
        }

        self.reactor.shutdown();
        if let Some(driver) = self.reactor_driver.take() {
            let _ = driver.join();
        }
    }
}
