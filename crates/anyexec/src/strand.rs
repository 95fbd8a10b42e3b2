// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{ExecMode, Executor, Reactor, Result, SequenceExecutor, Work, run_work};

struct StrandInner {
    queue: VecDeque<Work>,
    running: bool,
}

struct StrandCore {
    origin: Arc<dyn Executor>,
    inner: Mutex<StrandInner>,
}

impl StrandCore {
    fn exec(self: &Arc<Self>, work: Work, mode: ExecMode) {
        let mut inner = self.inner.lock();

        if mode == ExecMode::InlineIfPossible && !inner.running && inner.queue.is_empty() {
            // Nothing is in flight and nothing is queued ahead of us, so
            // running inline preserves both order and exclusivity.
            inner.running = true;
            drop(inner);

            run_work(work);
            self.work_finished();
            return;
        }

        inner.queue.push_back(work);
        if !inner.running {
            inner.running = true;
            drop(inner);
            self.dispatch();
        }
    }

    /// Hands one trampoline run to the origin executor. At most one is
    /// outstanding at any instant; that is what serializes the strand.
    fn dispatch(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.origin
            .exec(Box::new(move || this.run_one()), ExecMode::Queued);
    }

    fn run_one(self: &Arc<Self>) {
        let work = self.inner.lock().queue.pop_front();
        if let Some(work) = work {
            run_work(work);
        }

        self.work_finished();
    }

    fn work_finished(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.queue.is_empty() {
            inner.running = false;
        } else {
            drop(inner);
            self.dispatch();
        }
    }
}

/// A [`SequenceExecutor`] layered on top of any [`Executor`].
///
/// The strand keeps its own queue and feeds the underlying executor one
/// work item at a time, so submitted work runs serially in submission order
/// no matter how parallel the origin executor is. Work already queued keeps
/// running to completion even if the strand handle is dropped, because the
/// in-flight trampoline owns the queue.
pub struct StrandExecutor {
    core: Arc<StrandCore>,
}

impl fmt::Debug for StrandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("StrandExecutor")
            .field("queued", &inner.queue.len())
            .field("running", &inner.running)
            .finish()
    }
}

impl StrandExecutor {
    pub fn new(origin: Arc<dyn Executor>) -> Self {
        Self {
            core: Arc::new(StrandCore {
                origin,
                inner: Mutex::new(StrandInner {
                    queue: VecDeque::new(),
                    running: false,
                }),
            }),
        }
    }

    /// The executor this strand dispatches to.
    pub fn origin(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.core.origin)
    }
}

impl Executor for StrandExecutor {
    fn exec(&self, work: Work, mode: ExecMode) {
        self.core.exec(work, mode);
    }

    fn reactor(&self) -> Result<Reactor> {
        self.core.origin.reactor()
    }

    fn to_sequence(self: Arc<Self>) -> Option<Arc<dyn SequenceExecutor>> {
        Some(self)
    }
}

impl SequenceExecutor for StrandExecutor {}

/// Returns `executor` itself when it already serializes work, otherwise
/// wraps it in a [`StrandExecutor`].
pub fn make_strand(executor: Arc<dyn Executor>) -> Arc<dyn SequenceExecutor> {
    match Arc::clone(&executor).to_sequence() {
        Some(sequence) => sequence,
        None => Arc::new(StrandExecutor::new(executor)),
    }
}
