// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::{Consumer, ConsumerList, Producer};

const READY_TO_START: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const FINISHED: u8 = 3;

type ProducerFn<T> = Box<dyn FnMut() -> Option<T> + Send>;

struct FuncProducerCore<T> {
    state: AtomicU8,
    consumers: ConsumerList<T>,
    body: Mutex<Option<ProducerFn<T>>>,
}

impl<T> FuncProducerCore<T> {
    fn run(&self) {
        let mut body = self
            .body
            .lock()
            .take()
            .expect("the producer body is taken exactly once");

        while self.state.load(Ordering::Acquire) == RUNNING {
            match body() {
                Some(value) => {
                    let _ = self.consumers.consume(&value);
                }
                None => break,
            }
        }

        self.consumers.close();
        self.state.store(FINISHED, Ordering::Release);
    }
}

/// A producer that pumps values out of a closure on its own worker thread.
///
/// The closure returns `Some(value)` per produced value and `None` once the
/// stream is exhausted; each value is fanned out to the attached consumers.
/// When the producer finishes (or is stopped) the consumer list closes.
pub struct FuncProducer<T> {
    core: Arc<FuncProducerCore<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> fmt::Debug for FuncProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncProducer")
            .field("state", &self.core.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> FuncProducer<T> {
    pub fn new(body: impl FnMut() -> Option<T> + Send + 'static) -> Self {
        Self {
            core: Arc::new(FuncProducerCore {
                state: AtomicU8::new(READY_TO_START),
                consumers: ConsumerList::new(),
                body: Mutex::new(Some(Box::new(body))),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the worker thread. Returns whether this call started it; a
    /// producer runs at most once.
    pub fn start(&self) -> bool {
        if self
            .core
            .state
            .compare_exchange(READY_TO_START, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let core = Arc::clone(&self.core);
        let worker = thread::Builder::new()
            .name("overseer-producer".to_owned())
            .spawn(move || core.run())
            .expect("failed to spawn producer worker thread");

        *self.worker.lock() = Some(worker);
        true
    }

    /// Asks the worker to stop after the value it is currently producing.
    pub fn stop(&self) {
        let _ = self.core.state.compare_exchange(
            RUNNING,
            STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Joins the worker thread if it was started.
    pub fn wait(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl<T: Send + 'static> Producer<T> for FuncProducer<T> {
    fn attach_consumer(&self, consumer: Box<dyn Consumer<T>>) {
        self.core.consumers.add_consumer(consumer);
    }
}

impl<T> Drop for FuncProducer<T> {
    fn drop(&mut self) {
        let _ = self.core.state.compare_exchange(
            RUNNING,
            STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
