// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::{Error, Reactor, Result};

/// An opaque unit of work submitted to an [`Executor`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Controls whether an executor is allowed to run a work item synchronously
/// inside the `exec` call.
///
/// `InlineIfPossible` is a hint: the executor may still enqueue the item if
/// it cannot prove that inline execution preserves its guarantees (e.g. the
/// caller is not on one of the executor's threads, or a strand already has
/// work in flight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// The work item is never run from inside `exec`.
    Queued,

    /// The work item may run synchronously inside `exec` when that is safe.
    InlineIfPossible,
}

/// An object that can run work items.
///
/// Parallelism is implementation defined: a thread pool runs items
/// concurrently, a [`SequenceExecutor`] never does.
///
/// # Panics in work items
///
/// Executors are generic plumbing and cannot do anything meaningful with a
/// failure inside a work item. A panicking item is caught, logged at `warn`
/// level and otherwise discarded; the executor keeps running.
pub trait Executor: Send + Sync + 'static {
    /// Submits a work item.
    fn exec(&self, work: Work, mode: ExecMode);

    /// Returns the reactor that deferred work (timers, completions) can be
    /// scheduled on. Executors not backed by one report
    /// [`Error::NoReactor`], which is also the default.
    fn reactor(&self) -> Result<Reactor> {
        Err(Error::NoReactor)
    }

    /// Returns this executor as a [`SequenceExecutor`] if it already
    /// guarantees serial execution, so callers can avoid stacking a strand
    /// on top of it.
    fn to_sequence(self: Arc<Self>) -> Option<Arc<dyn SequenceExecutor>> {
        None
    }
}

/// An [`Executor`] that additionally guarantees that no two submitted items
/// run concurrently and that items run in submission order.
pub trait SequenceExecutor: Executor {}

/// Runs a work item, containing and logging a panic.
pub(crate) fn run_work(work: Work) {
    if catch_unwind(AssertUnwindSafe(work)).is_err() {
        tracing::warn!(target: "anyexec", "a work item panicked; the panic was discarded");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Runs everything on the calling thread; deliberately has no reactor.
    struct CallerThreadExecutor;

    impl Executor for CallerThreadExecutor {
        fn exec(&self, work: Work, _mode: ExecMode) {
            run_work(work);
        }
    }

    #[test]
    fn reactor_defaults_to_no_reactor() {
        let executor = CallerThreadExecutor;
        assert!(matches!(executor.reactor(), Err(Error::NoReactor)));
    }

    #[test]
    fn custom_executors_still_run_work() {
        let executor = CallerThreadExecutor;
        let ran = std::sync::Arc::new(AtomicBool::new(false));

        let flag = std::sync::Arc::clone(&ran);
        executor.exec(
            Box::new(move || flag.store(true, Ordering::SeqCst)),
            ExecMode::Queued,
        );

        assert!(ran.load(Ordering::SeqCst));
    }
}
