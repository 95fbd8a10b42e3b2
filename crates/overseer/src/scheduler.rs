// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use anyexec::{Executor, ThreadExecutor};
use parking_lot::Mutex;
use tether::{
    AoContext, Error, Future, Promise, Result, async_invoke, invoke, make_ready_future,
    promise_list_future, resolve_promises,
};

use crate::{ManageableTask, TaskContext, TaskState};

/// Identifies a task pushed into a [`Scheduler`].
pub type TaskId = u64;

type TaskBody = Box<dyn FnOnce(&TaskContext) -> Result<()> + Send>;

struct SchedTask {
    id: TaskId,
    priority: i32,
    controller: ManageableTask,
    /// Whether the task was ever resumed; a never-started task can be
    /// cancelled by simply discarding it.
    already_started: bool,
    /// Deferred deactivation requests made while the task was waiting.
    pause_promises: Vec<Promise<()>>,
    resume_promises: Vec<Promise<()>>,
    /// Non-empty marks the task as cancelled; the promises resolve once it
    /// has stopped.
    stop_promises: Vec<Promise<()>>,
    wait_promises: Vec<Promise<()>>,
}

impl SchedTask {
    fn cancelled(&self) -> bool {
        !self.stop_promises.is_empty()
    }

    fn deactivation_requested(&self) -> bool {
        !self.pause_promises.is_empty()
    }

    fn resume(&mut self, resolved: &mut Vec<Promise<()>>) {
        self.already_started = true;
        if self.cancelled() {
            self.controller.stop();
        } else {
            self.controller.resume();
            resolved.append(&mut self.resume_promises);
        }
    }

    fn pause(&mut self, resolved: &mut Vec<Promise<()>>) {
        self.controller.pause();
        resolved.append(&mut self.pause_promises);
    }

    fn cancel_later(&mut self) -> Future<()> {
        promise_list_future(&mut self.stop_promises)
    }
}

impl Drop for SchedTask {
    fn drop(&mut self) {
        let mut promises = std::mem::take(&mut self.pause_promises);
        promises.extend(std::mem::take(&mut self.resume_promises));
        promises.extend(std::mem::take(&mut self.stop_promises));
        promises.extend(std::mem::take(&mut self.wait_promises));
        resolve_promises(promises, ());
    }
}

/// Promise resolutions and task drops deferred until the scheduler state
/// lock has been released; both can run arbitrary user continuations.
#[derive(Default)]
struct Effects {
    resolved: Vec<Promise<()>>,
    dropped: Vec<SchedTask>,
}

impl Effects {
    fn apply(self) {
        resolve_promises(self.resolved, ());
        drop(self.dropped);
    }
}

struct SchedState {
    active: Option<SchedTask>,
    /// Waiting tasks in ascending priority order; the back is next.
    waiting: Vec<SchedTask>,
    /// Deactivated tasks stay here until explicitly activated.
    deactivated: Vec<SchedTask>,
    next_id: TaskId,
    wait_all_promises: Vec<Promise<()>>,
}

struct SchedulerShared {
    ao: AoContext,
    state: Mutex<SchedState>,
}

impl SchedulerShared {
    fn push_inner(self: &Arc<Self>, priority: i32, body: TaskBody) -> TaskId {
        let controller = ManageableTask::create(body);

        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            id
        };

        // Watch for the task finishing, whichever way that happens.
        let weak = Arc::downgrade(self);
        let _ = controller
            .async_wait_stopped()
            .via(&self.ao)
            .then(move |()| {
                if let Some(shared) = weak.upgrade() {
                    shared.task_finished(id);
                }
            });

        let task = SchedTask {
            id,
            priority,
            controller,
            already_started: false,
            pause_promises: Vec::new(),
            resume_promises: Vec::new(),
            stop_promises: Vec::new(),
            wait_promises: Vec::new(),
        };

        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            Self::schedule(&mut state, task, &mut effects);
        }
        effects.apply();

        id
    }

    /// Places a task: it becomes active immediately if nothing is active or
    /// it outranks the active task (which is then preempted); otherwise it
    /// queues by priority.
    fn schedule(state: &mut SchedState, mut task: SchedTask, effects: &mut Effects) {
        let Some(active_priority) = state.active.as_ref().map(|active| active.priority) else {
            debug_assert!(state.waiting.is_empty());
            task.resume(&mut effects.resolved);
            state.active = Some(task);
            return;
        };

        if active_priority < task.priority {
            let mut preempted = state.active.take().expect("checked above");
            preempted.pause(&mut effects.resolved);
            Self::enqueue(&mut state.waiting, preempted);

            task.resume(&mut effects.resolved);
            state.active = Some(task);
        } else {
            Self::enqueue(&mut state.waiting, task);
        }
    }

    fn enqueue(waiting: &mut Vec<SchedTask>, task: SchedTask) {
        let position = waiting.partition_point(|queued| queued.priority < task.priority);
        waiting.insert(position, task);
    }

    fn task_finished(&self, id: TaskId) {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            if state.active.as_ref().is_some_and(|task| task.id == id) {
                debug_assert_eq!(
                    state.active.as_ref().map(|task| task.controller.state()),
                    Some(TaskState::Stopped)
                );
                if let Some(finished) = state.active.take() {
                    effects.dropped.push(finished);
                }
                Self::resume_next(&mut state, &mut effects);
            } else {
                Self::erase_task(&mut state, id, &mut effects);
            }
        }
        effects.apply();
    }

    fn erase_task(state: &mut SchedState, id: TaskId, effects: &mut Effects) {
        if let Some(position) = state.waiting.iter().position(|task| task.id == id) {
            effects.dropped.push(state.waiting.remove(position));
            return;
        }
        if let Some(position) = state.deactivated.iter().position(|task| task.id == id) {
            effects.dropped.push(state.deactivated.remove(position));
        }
    }

    /// Promotes the highest-priority waiting task. Tasks with a deferred
    /// deactivation land in the deactivated list instead; when nothing
    /// remains, pending wait-all promises resolve.
    fn resume_next(state: &mut SchedState, effects: &mut Effects) {
        debug_assert!(state.active.is_none());

        while let Some(mut task) = state.waiting.pop() {
            if task.deactivation_requested() {
                task.pause(&mut effects.resolved);
                state.deactivated.push(task);
            } else {
                task.resume(&mut effects.resolved);
                state.active = Some(task);
                return;
            }
        }

        if state.deactivated.is_empty() {
            effects
                .resolved
                .append(&mut state.wait_all_promises);
        }
    }

    fn cancel_inner(self: &Arc<Self>, id: TaskId) -> Future<()> {
        let mut effects = Effects::default();
        let future = {
            let mut state = self.state.lock();

            if let Some(active) = state.active.as_ref().filter(|task| task.id == id) {
                active.controller.async_stop();
                active.controller.async_wait_stopped()
            } else if let Some(position) = state.waiting.iter().position(|task| task.id == id) {
                let future = state.waiting[position].cancel_later();
                // A task that never ran is removed on the spot.
                if !state.waiting[position].already_started {
                    let task = state.waiting.remove(position);
                    effects.dropped.push(task);
                }
                future
            } else if let Some(position) = state.deactivated.iter().position(|task| task.id == id)
            {
                let mut task = state.deactivated.remove(position);
                let future = task.cancel_later();
                // Rescheduling a cancelled task makes it stop as soon as
                // its turn comes.
                Self::schedule(&mut state, task, &mut effects);
                future
            } else {
                make_ready_future(())
            }
        };
        effects.apply();

        future
    }

    fn deactivate_inner(&self, id: TaskId) -> Future<()> {
        let mut effects = Effects::default();
        let future = {
            let mut state = self.state.lock();

            if state.active.as_ref().is_some_and(|task| task.id == id) {
                let mut task = state.active.take().expect("just checked");
                task.pause(&mut effects.resolved);
                state.deactivated.push(task);
                Self::resume_next(&mut state, &mut effects);
                make_ready_future(())
            } else if let Some(position) = state.waiting.iter().position(|task| task.id == id) {
                promise_list_future(&mut state.waiting[position].pause_promises)
            } else {
                make_ready_future(())
            }
        };
        effects.apply();

        future
    }

    fn activate_inner(&self, id: TaskId) -> Future<()> {
        let mut effects = Effects::default();
        let future = {
            let mut state = self.state.lock();

            if let Some(position) = state.waiting.iter().position(|task| task.id == id) {
                promise_list_future(&mut state.waiting[position].resume_promises)
            } else if let Some(position) = state.deactivated.iter().position(|task| task.id == id)
            {
                let mut task = state.deactivated.remove(position);
                let future = promise_list_future(&mut task.resume_promises);
                Self::schedule(&mut state, task, &mut effects);
                future
            } else {
                make_ready_future(())
            }
        };
        effects.apply();

        future
    }

    fn wait_inner(&self, id: TaskId) -> Future<()> {
        let mut state = self.state.lock();

        if state.active.as_ref().is_some_and(|task| task.id == id) {
            let active = state.active.as_mut().expect("just checked");
            return promise_list_future(&mut active.wait_promises);
        }
        if let Some(position) = state.waiting.iter().position(|task| task.id == id) {
            return promise_list_future(&mut state.waiting[position].wait_promises);
        }
        if let Some(position) = state.deactivated.iter().position(|task| task.id == id) {
            return promise_list_future(&mut state.deactivated[position].wait_promises);
        }

        make_ready_future(())
    }

    fn wait_all_inner(&self) -> Future<()> {
        let mut state = self.state.lock();

        if state.active.is_none() {
            return make_ready_future(());
        }

        promise_list_future(&mut state.wait_all_promises)
    }

    fn clear_inner(self: &Arc<Self>) -> Future<()> {
        let stop_ids = {
            let mut state = self.state.lock();

            // Deactivated tasks rejoin the queue so the stop chain below
            // covers them too.
            while let Some(task) = state.deactivated.pop() {
                Self::enqueue(&mut state.waiting, task);
            }

            state.waiting.iter().rev().map(|task| task.id).collect::<Vec<_>>()
        };

        let mut future = {
            let state = self.state.lock();
            match &state.active {
                Some(active) => {
                    let stopped = active.controller.async_wait_stopped();
                    active.controller.async_stop();
                    stopped
                }
                None => make_ready_future(()),
            }
        };

        for id in stop_ids {
            let weak = Arc::downgrade(self);
            future = future
                .via(&self.ao)
                .then(move |()| match weak.upgrade() {
                    Some(shared) => shared.stop_waiting(id),
                    None => make_ready_future(()),
                })
                .flatten();
        }

        let weak = Arc::downgrade(self);
        future.via(&self.ao).then(move |()| {
            if let Some(shared) = weak.upgrade() {
                let leftovers = std::mem::take(&mut shared.state.lock().waiting);
                drop(leftovers);
            }
        })
    }

    fn stop_waiting(&self, id: TaskId) -> Future<()> {
        let state = self.state.lock();

        match state.waiting.iter().find(|task| task.id == id) {
            Some(task) => {
                task.controller.async_stop();
                task.controller.async_wait_stopped()
            }
            None => make_ready_future(()),
        }
    }

    fn active_task_id_inner(&self) -> Option<TaskId> {
        self.state.lock().active.as_ref().map(|task| task.id)
    }

    fn task_state_inner(&self, id: TaskId) -> Option<TaskState> {
        let state = self.state.lock();

        state
            .active
            .iter()
            .chain(state.waiting.iter())
            .chain(state.deactivated.iter())
            .find(|task| task.id == id)
            .map(|task| task.controller.state())
    }

    fn size_inner(&self) -> usize {
        let state = self.state.lock();
        state.waiting.len() + state.deactivated.len() + usize::from(state.active.is_some())
    }
}

/// A priority-preemptive queue of [`ManageableTask`]s with exactly one
/// active task.
///
/// The active task always has at least the priority of every waiting task:
/// pushing a higher-priority task pauses the active one at its next
/// checkpoint and runs the newcomer. Deactivated tasks sit out until
/// explicitly activated again.
///
/// All mutations are serialized through the scheduler's own context; the
/// synchronous verbs fail with [`Error::DetectedDeadlock`] when called from
/// inside that context, since they would block on work only it can run.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("size", &self.shared.size_inner())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let executor = Arc::new(ThreadExecutor::with_name("overseer-scheduler"));

        Self {
            shared: Arc::new(SchedulerShared {
                ao: AoContext::new(executor as Arc<dyn Executor>),
                state: Mutex::new(SchedState {
                    active: None,
                    waiting: Vec::new(),
                    deactivated: Vec::new(),
                    next_id: 0,
                    wait_all_promises: Vec::new(),
                }),
            }),
        }
    }

    /// Creates a task (initially paused), schedules it and returns its id.
    /// The task starts as soon as the priority rules allow.
    pub fn push(
        &self,
        body: impl FnOnce(&TaskContext) -> Result<()> + Send + 'static,
        priority: i32,
    ) -> Result<TaskId> {
        let shared = Arc::clone(&self.shared);
        invoke(&self.shared.ao, move || {
            shared.push_inner(priority, Box::new(body))
        })
    }

    pub fn active_task_id(&self) -> Result<Option<TaskId>> {
        let shared = Arc::clone(&self.shared);
        invoke(&self.shared.ao, move || shared.active_task_id_inner())
    }

    pub fn task_state(&self, id: TaskId) -> Result<Option<TaskState>> {
        let shared = Arc::clone(&self.shared);
        invoke(&self.shared.ao, move || shared.task_state_inner(id))
    }

    pub fn size(&self) -> Result<usize> {
        let shared = Arc::clone(&self.shared);
        invoke(&self.shared.ao, move || shared.size_inner())
    }

    /// Resolves once the task has left the scheduler (stopped or
    /// cancelled). Unknown ids resolve immediately.
    pub fn async_wait(&self, id: TaskId) -> Future<()> {
        let shared = Arc::clone(&self.shared);
        async_invoke(&self.shared.ao, move || shared.wait_inner(id)).flatten()
    }

    pub fn wait(&self, id: TaskId) -> Result<()> {
        self.ensure_blocking_allowed()?;
        self.async_wait(id).get()
    }

    /// Resolves once no task remains in the scheduler.
    pub fn async_wait_all(&self) -> Future<()> {
        let shared = Arc::clone(&self.shared);
        async_invoke(&self.shared.ao, move || shared.wait_all_inner()).flatten()
    }

    pub fn wait_all(&self) -> Result<()> {
        self.ensure_blocking_allowed()?;
        self.async_wait_all().get()
    }

    /// Cancels a task: the active task is stopped, a waiting task that
    /// never ran is discarded, and a deactivated task is rescheduled so it
    /// stops as soon as its turn comes.
    pub fn async_cancel(&self, id: TaskId) -> Future<()> {
        let shared = Arc::clone(&self.shared);
        async_invoke(&self.shared.ao, move || shared.cancel_inner(id)).flatten()
    }

    pub fn cancel(&self, id: TaskId) -> Result<()> {
        self.ensure_blocking_allowed()?;
        self.async_cancel(id).get()
    }

    /// Stops every task; resolves when all of them have stopped.
    pub fn async_clear(&self) -> Future<()> {
        let shared = Arc::clone(&self.shared);
        async_invoke(&self.shared.ao, move || shared.clear_inner()).flatten()
    }

    pub fn clear(&self) -> Result<()> {
        self.ensure_blocking_allowed()?;
        self.async_clear().get()
    }

    /// Takes a task out of the rotation: the active task is paused and the
    /// next waiting task promoted; a waiting task is deactivated as soon as
    /// it would otherwise become active.
    pub fn async_deactivate(&self, id: TaskId) -> Future<()> {
        let shared = Arc::clone(&self.shared);
        async_invoke(&self.shared.ao, move || shared.deactivate_inner(id)).flatten()
    }

    pub fn deactivate(&self, id: TaskId) -> Result<()> {
        self.ensure_blocking_allowed()?;
        self.async_deactivate(id).get()
    }

    /// Puts a deactivated task back into the rotation.
    pub fn async_activate(&self, id: TaskId) -> Future<()> {
        let shared = Arc::clone(&self.shared);
        async_invoke(&self.shared.ao, move || shared.activate_inner(id)).flatten()
    }

    pub fn activate(&self, id: TaskId) -> Result<()> {
        self.ensure_blocking_allowed()?;
        self.async_activate(id).get()
    }

    fn ensure_blocking_allowed(&self) -> Result<()> {
        if self.shared.ao.in_this_thread() {
            return Err(Error::DetectedDeadlock);
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.clear();
        self.shared.ao.close();
    }
}
