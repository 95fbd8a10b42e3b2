// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tether::{Error, Future, Promise, Result, make_ready_future, promise_list_future, resolve_promises};

/// Lifecycle of a [`ManageableTask`].
///
/// ```text
/// Waiting -> Running <-> Pausing -> Paused <-> Resuming
///                 any state -> Stopping -> Stopped (terminal)
/// ```
///
/// Transitions out of `Pausing`/`Resuming` happen at the task's next
/// [`checkpoint`][TaskContext::checkpoint]; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Waiting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
}

type BeforePause = Box<dyn FnMut() -> bool + Send>;
type AfterPause = Box<dyn FnMut() + Send>;

struct TaskInner {
    state: TaskState,
    error: Option<Error>,
    pause_promises: Vec<Promise<()>>,
    resume_promises: Vec<Promise<()>>,
    stop_promises: Vec<Promise<()>>,
    before_pause: Option<BeforePause>,
    after_pause: Option<AfterPause>,
    was_paused: bool,
}

struct TaskCore {
    inner: Mutex<TaskInner>,
    state_changed: Condvar,
}

impl TaskCore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TaskInner {
                state: TaskState::Waiting,
                error: None,
                pause_promises: Vec::new(),
                resume_promises: Vec::new(),
                stop_promises: Vec::new(),
                before_pause: None,
                after_pause: None,
                was_paused: false,
            }),
            state_changed: Condvar::new(),
        })
    }

    fn run(self: &Arc<Self>, body: impl FnOnce(&TaskContext) -> Result<()>) {
        let context = TaskContext {
            core: Arc::clone(self),
        };

        {
            let mut inner = self.inner.lock();
            if inner.state == TaskState::Waiting {
                inner.state = TaskState::Running;
            }
        }

        let error = if context.checkpoint() {
            match catch_unwind(AssertUnwindSafe(|| body(&context))) {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(payload) => Some(Error::from_panic(payload)),
            }
        } else {
            None
        };

        self.stopped(error);
    }

    /// Terminal transition: every pending pause/resume/stop promise is
    /// resolved (not rejected), the captured error becomes retrievable.
    fn stopped(&self, error: Option<Error>) {
        let mut inner = self.inner.lock();
        inner.state = TaskState::Stopped;
        inner.error = error;

        let mut promises = std::mem::take(&mut inner.pause_promises);
        promises.extend(std::mem::take(&mut inner.resume_promises));
        promises.extend(std::mem::take(&mut inner.stop_promises));
        drop(inner);

        resolve_promises(promises, ());
    }

    fn async_pause(&self) -> Future<()> {
        let mut inner = self.inner.lock();

        match inner.state {
            TaskState::Waiting | TaskState::Running => {
                inner.state = TaskState::Pausing;
                self.state_changed.notify_one();
                promise_list_future(&mut inner.pause_promises)
            }
            TaskState::Resuming => {
                // The resume never took effect; outdated resume waiters are
                // released as satisfied.
                inner.state = TaskState::Paused;
                let outdated = std::mem::take(&mut inner.resume_promises);
                drop(inner);
                resolve_promises(outdated, ());
                make_ready_future(())
            }
            TaskState::Pausing | TaskState::Stopping => {
                promise_list_future(&mut inner.pause_promises)
            }
            TaskState::Paused | TaskState::Stopped => make_ready_future(()),
        }
    }

    fn async_resume(&self) -> Future<()> {
        let mut inner = self.inner.lock();

        match inner.state {
            TaskState::Waiting | TaskState::Running | TaskState::Stopping | TaskState::Stopped => {
                make_ready_future(())
            }
            TaskState::Pausing => {
                // The pause never took effect.
                inner.state = TaskState::Running;
                let outdated = std::mem::take(&mut inner.pause_promises);
                drop(inner);
                resolve_promises(outdated, ());
                make_ready_future(())
            }
            TaskState::Resuming => promise_list_future(&mut inner.resume_promises),
            TaskState::Paused => {
                inner.state = TaskState::Resuming;
                self.state_changed.notify_one();
                promise_list_future(&mut inner.resume_promises)
            }
        }
    }

    fn async_stop(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            TaskState::Waiting
            | TaskState::Running
            | TaskState::Pausing
            | TaskState::Resuming
            | TaskState::Paused => {
                inner.state = TaskState::Stopping;
                self.state_changed.notify_one();
            }
            TaskState::Stopping | TaskState::Stopped => {}
        }
    }

    fn async_wait_stopped(&self) -> Future<()> {
        let mut inner = self.inner.lock();

        if inner.state == TaskState::Stopped {
            return make_ready_future(());
        }

        promise_list_future(&mut inner.stop_promises)
    }

    fn checkpoint(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.was_paused = false;

        loop {
            match inner.state {
                TaskState::Running => return true,
                TaskState::Pausing => {
                    if !self.pause_allowed(&mut inner) {
                        // The hook vetoed; retry at the next checkpoint.
                        return inner.state != TaskState::Stopping;
                    }
                    if inner.state != TaskState::Pausing {
                        // The state moved while the hook ran unlocked.
                        continue;
                    }

                    self.do_pause(&mut inner);
                    return inner.state != TaskState::Stopping;
                }
                TaskState::Stopping => return false,
                TaskState::Waiting
                | TaskState::Paused
                | TaskState::Resuming
                | TaskState::Stopped => {
                    unreachable!("checkpoint observed worker-only state transition")
                }
            }
        }
    }

    /// Consults the `before_pause` hook with the lock released.
    fn pause_allowed(&self, inner: &mut MutexGuard<'_, TaskInner>) -> bool {
        let Some(mut hook) = inner.before_pause.take() else {
            return true;
        };

        let allowed = {
            MutexGuard::unlocked(inner, || hook())
        };

        if inner.before_pause.is_none() {
            inner.before_pause = Some(hook);
        }

        allowed
    }

    fn do_pause(&self, inner: &mut MutexGuard<'_, TaskInner>) {
        debug_assert_eq!(inner.state, TaskState::Pausing);

        inner.state = TaskState::Paused;
        let pause_promises = std::mem::take(&mut inner.pause_promises);
        MutexGuard::unlocked(inner, || resolve_promises(pause_promises, ()));

        while inner.state == TaskState::Paused {
            self.state_changed.wait(inner);
        }

        debug_assert!(matches!(
            inner.state,
            TaskState::Resuming | TaskState::Stopping
        ));
        if inner.state == TaskState::Resuming {
            inner.state = TaskState::Running;
        }

        let resume_promises = std::mem::take(&mut inner.resume_promises);
        MutexGuard::unlocked(inner, || resolve_promises(resume_promises, ()));

        inner.was_paused = true;
        if let Some(mut hook) = inner.after_pause.take() {
            MutexGuard::unlocked(inner, || hook());
            if inner.after_pause.is_none() {
                inner.after_pause = Some(hook);
            }
        }
    }
}

/// Handed to the task function; the cooperation surface of the task.
pub struct TaskContext {
    core: Arc<TaskCore>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("state", &self.core.inner.lock().state)
            .finish()
    }
}

impl TaskContext {
    /// The task's cooperative yield point.
    ///
    /// Returns `true` if the task should keep running and `false` once stop
    /// was requested. While a pause is pending the call blocks until the
    /// task is resumed or stopped; the optional `before_pause` hook can
    /// veto the pause, deferring it to the next checkpoint.
    pub fn checkpoint(&self) -> bool {
        self.core.checkpoint()
    }

    /// Installs a hook consulted before the task parks for a pause; a
    /// `false` return defers the pause to the next checkpoint.
    pub fn set_before_pause(&self, hook: impl FnMut() -> bool + Send + 'static) {
        self.core.inner.lock().before_pause = Some(Box::new(hook));
    }

    /// Installs a hook that runs right after the task wakes from a pause.
    pub fn set_after_pause(&self, hook: impl FnMut() + Send + 'static) {
        self.core.inner.lock().after_pause = Some(Box::new(hook));
    }

    /// Whether the most recent [`checkpoint`][Self::checkpoint] went
    /// through a pause.
    pub fn was_paused(&self) -> bool {
        self.core.inner.lock().was_paused
    }
}

/// A worker thread running a user function under cooperative control.
///
/// The function receives a [`TaskContext`] and must poll
/// [`checkpoint`][TaskContext::checkpoint] regularly; pause, resume and
/// stop all take effect at checkpoints. Dropping the task stops it and
/// joins the worker.
pub struct ManageableTask {
    core: Arc<TaskCore>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for ManageableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManageableTask")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ManageableTask {
    /// Starts the task running immediately.
    pub fn start(body: impl FnOnce(&TaskContext) -> Result<()> + Send + 'static) -> Self {
        let core = TaskCore::new();
        let worker = Self::spawn_worker(&core, body);

        Self {
            core,
            worker: Some(worker),
        }
    }

    /// Starts the task paused; returns once the worker has reached its
    /// first checkpoint and parked.
    pub fn create(body: impl FnOnce(&TaskContext) -> Result<()> + Send + 'static) -> Self {
        let core = TaskCore::new();
        let mut paused = core.async_pause();
        let worker = Self::spawn_worker(&core, body);
        paused.wait();

        Self {
            core,
            worker: Some(worker),
        }
    }

    fn spawn_worker(
        core: &Arc<TaskCore>,
        body: impl FnOnce(&TaskContext) -> Result<()> + Send + 'static,
    ) -> JoinHandle<()> {
        let core = Arc::clone(core);
        thread::Builder::new()
            .name("overseer-task".to_owned())
            .spawn(move || core.run(body))
            .expect("failed to spawn task worker thread")
    }

    pub fn state(&self) -> TaskState {
        self.core.inner.lock().state
    }

    /// Requests a pause; the future resolves once the task has parked (or
    /// reached a terminal state).
    pub fn async_pause(&self) -> Future<()> {
        self.core.async_pause()
    }

    /// Requests a resume; the future resolves once the task runs again.
    pub fn async_resume(&self) -> Future<()> {
        self.core.async_resume()
    }

    /// Requests a stop; the next checkpoint observes it.
    pub fn async_stop(&self) {
        self.core.async_stop();
    }

    /// A future that resolves once the task has stopped.
    pub fn async_wait_stopped(&self) -> Future<()> {
        self.core.async_wait_stopped()
    }

    pub fn pause(&self) {
        let mut done = self.async_pause();
        done.wait();
    }

    pub fn resume(&self) {
        let mut done = self.async_resume();
        done.wait();
    }

    pub fn stop(&self) {
        self.async_stop();
        self.wait_stopped();
    }

    pub fn wait_stopped(&self) {
        let mut done = self.async_wait_stopped();
        done.wait();
    }

    /// The error captured from the task function, if it failed or
    /// panicked.
    pub fn error(&self) -> Option<Error> {
        self.core.inner.lock().error.clone()
    }
}

impl Drop for ManageableTask {
    fn drop(&mut self) {
        self.core.async_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
