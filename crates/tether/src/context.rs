// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod reentrancy;
mod state;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use anyexec::{ExecMode, Executor, SequenceExecutor, make_strand};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::{Error, Result};
use reentrancy::{ClosingGuard, GroupGuard, group_entry_count, in_group, is_closing_here};
use state::ContextState;

/// Group ids mark sets of contexts (a root and its descendants) whose work
/// is mutually serialized through one strand.
static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// A callable registered on a context, invoked exactly once when the
/// context closes.
///
/// Handlers run on the thread performing the close, after all in-flight
/// context work has drained and in LIFO registration order.
pub trait CloseHandler: Send + Sync {
    fn on_close(&self);
}

/// Identifies a registered close handler for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseHandlerId(u64);

struct HandlerSlot {
    id: u64,
    handler: Arc<dyn CloseHandler>,
    /// Set once `on_close` has returned (or was skipped because the slot
    /// was detached first). Removal waits on this.
    done: AtomicBool,
}

#[derive(Default)]
struct HandlerList {
    /// Registration order; close pops from the back, giving LIFO firing.
    slots: Vec<Arc<HandlerSlot>>,
    /// The slot whose `on_close` the close sequence is currently running.
    running: Option<Arc<HandlerSlot>>,
}

pub(crate) struct ContextCore {
    state: ContextState,
    group: u64,
    strand: Mutex<Option<Arc<dyn SequenceExecutor>>>,
    handlers: Mutex<HandlerList>,
    next_handler_id: AtomicU64,
    parent: Option<Arc<ContextCore>>,
    /// Our registration in the parent's handler list, used both for
    /// deregistration and for the early-done marking that keeps concurrent
    /// parent/child closes from waiting on each other.
    parent_slot: OnceCell<(u64, Arc<HandlerSlot>)>,
}

impl ContextCore {
    fn new_root(executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            state: ContextState::new(),
            group: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            strand: Mutex::new(Some(make_strand(executor))),
            handlers: Mutex::new(HandlerList::default()),
            next_handler_id: AtomicU64::new(1),
            parent: None,
            parent_slot: OnceCell::new(),
        })
    }

    fn new_child(parent: &Arc<Self>) -> Result<Arc<Self>> {
        if !parent.state.block_close() {
            return Err(Error::ContextClosed);
        }
        let _unblock = scopeguard::guard((), |()| parent.state.unblock_close());

        let strand = parent.strand().ok_or(Error::ContextClosed)?;
        let child = Arc::new(Self {
            state: ContextState::new(),
            group: parent.group,
            strand: Mutex::new(Some(strand)),
            handlers: Mutex::new(HandlerList::default()),
            next_handler_id: AtomicU64::new(1),
            parent: Some(Arc::clone(parent)),
            parent_slot: OnceCell::new(),
        });

        // We hold a close reservation on the parent, so registering without
        // a second reservation is safe: a concurrent close will pick the
        // new slot up after the drain point.
        let registration = parent.register_handler(Arc::clone(&child) as Arc<dyn CloseHandler>);
        child
            .parent_slot
            .set(registration)
            .unwrap_or_else(|_| unreachable!("the parent slot is set exactly once"));

        Ok(child)
    }

    fn strand(&self) -> Option<Arc<dyn SequenceExecutor>> {
        self.strand.lock().clone()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub(crate) fn in_this_thread(&self) -> bool {
        in_group(self.group)
    }

    pub(crate) fn executor(&self) -> Result<Arc<dyn SequenceExecutor>> {
        self.strand().ok_or(Error::ContextClosed)
    }

    /// Submits `work` to the context's strand.
    ///
    /// Returns whether the work was accepted; once close has been requested
    /// the work is dropped instead. Accepted work blocks close until it has
    /// run (or been discarded by the closing strand).
    pub(crate) fn exec(
        self: &Arc<Self>,
        work: impl FnOnce() + Send + 'static,
        mode: ExecMode,
    ) -> bool {
        if !self.state.block_close() {
            return false;
        }
        let _unblock = scopeguard::guard((), |()| self.state.unblock_close());

        if mode == ExecMode::InlineIfPossible && self.in_this_thread() {
            // Already inside this group's current work item; a nested run
            // preserves the serialization guarantee and skips a queue hop.
            // The group mark makes the reservation taken above count as our
            // own, so the work may close the context without deadlocking on
            // the drain.
            let _group = GroupGuard::enter(self.group);
            run_context_work(work);
            return true;
        }

        let Some(strand) = self.strand() else {
            return false;
        };

        // Mark the group for the duration of the submit call, so a strand
        // that runs the trampoline synchronously is recognized below.
        let _group = GroupGuard::enter(self.group);

        let this = Arc::clone(self);
        strand.exec(
            Box::new(move || {
                if this.in_this_thread() {
                    // The strand ran us synchronously inside `exec`; the
                    // caller's reservation and group mark still cover us.
                    run_context_work(work);
                    return;
                }

                // Dispatched asynchronously: take our own reservation and
                // group mark for the duration of the work.
                if !this.state.block_close() {
                    return;
                }
                {
                    let _group = GroupGuard::enter(this.group);
                    run_context_work(work);
                }
                this.state.unblock_close();
            }),
            mode,
        );

        true
    }

    pub(crate) fn add_close_handler(&self, handler: Arc<dyn CloseHandler>) -> Result<CloseHandlerId> {
        if !self.state.block_close() {
            return Err(Error::ContextClosed);
        }
        let _unblock = scopeguard::guard((), |()| self.state.unblock_close());

        let (id, _slot) = self.register_handler(handler);
        Ok(CloseHandlerId(id))
    }

    fn register_handler(&self, handler: Arc<dyn CloseHandler>) -> (u64, Arc<HandlerSlot>) {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(HandlerSlot {
            id,
            handler,
            done: AtomicBool::new(false),
        });

        self.handlers.lock().slots.push(Arc::clone(&slot));
        (id, slot)
    }

    /// Detaches a close handler.
    ///
    /// On return the handler is guaranteed not to run anymore: if its
    /// `on_close` is currently executing on another thread, the call blocks
    /// until it finishes. The one exception is removal from within this
    /// context's own close sequence (e.g. from inside a close handler),
    /// which returns immediately to avoid waiting on itself.
    pub(crate) fn remove_close_handler(&self, id: CloseHandlerId) {
        let mut handlers = self.handlers.lock();

        if let Some(position) = handlers.slots.iter().position(|slot| slot.id == id.0) {
            handlers.slots.remove(position);
            return;
        }

        let running = match &handlers.running {
            Some(slot) if slot.id == id.0 => Arc::clone(slot),
            _ => return, // Already fired and finished.
        };
        drop(handlers);

        if is_closing_here(self.address()) {
            return;
        }

        while !running.done.load(Ordering::Acquire) {
            thread::yield_now();
        }
    }

    pub(crate) fn start_cancellable(
        &self,
        start: impl FnOnce() -> Result<()>,
        handler: Arc<dyn CloseHandler>,
    ) -> Result<CloseHandlerId> {
        if !self.state.block_close() {
            return Err(Error::ContextClosed);
        }
        let _unblock = scopeguard::guard((), |()| self.state.unblock_close());

        let (id, _slot) = self.register_handler(handler);
        if let Err(error) = start() {
            self.remove_close_handler(CloseHandlerId(id));
            return Err(error);
        }

        Ok(CloseHandlerId(id))
    }

    /// Closes the context. Idempotent; on return the context is `Closed`
    /// unless the call re-entered an in-progress close on the same thread.
    pub(crate) fn close(&self) {
        if self.state.start_close() {
            let _closing = ClosingGuard::enter(self.address());

            // Wait for reservations held by other threads; our own (we may
            // be closing from inside context work) do not count.
            let own = group_entry_count(self.group);
            while self.state.block_close_count() > own {
                thread::yield_now();
            }
            self.state.set_closing_flag();

            self.fire_close_handlers();

            if let (Some(parent), Some((id, _slot))) = (&self.parent, self.parent_slot.get()) {
                parent.remove_close_handler(CloseHandlerId(*id));
            }

            *self.strand.lock() = None;
            self.state.set_closed_flag();
        } else {
            self.wait_for_closed();
        }
    }

    fn fire_close_handlers(&self) {
        loop {
            let slot = {
                let mut handlers = self.handlers.lock();
                match handlers.slots.pop() {
                    Some(slot) => {
                        handlers.running = Some(Arc::clone(&slot));
                        slot
                    }
                    None => break,
                }
            };

            if catch_unwind(AssertUnwindSafe(|| slot.handler.on_close())).is_err() {
                tracing::warn!(target: "tether", "a close handler panicked; the panic was discarded");
            }

            self.handlers.lock().running = None;
            slot.done.store(true, Ordering::Release);
        }
    }

    fn wait_for_closed(&self) {
        if is_closing_here(self.address()) {
            // Close was re-entered from one of our own close handlers.
            return;
        }

        if self.in_this_thread() {
            // Closing from inside our own work; waiting would deadlock on
            // the reservation that work holds.
            return;
        }

        self.state.wait_closed();
    }

    fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }
}

impl CloseHandler for ContextCore {
    /// Invoked by the parent's close sequence: closing the parent closes
    /// the child.
    fn on_close(&self) {
        // Mark our parent slot done up front. A concurrent close of this
        // child would otherwise block in the parent's removal (waiting for
        // this very call to finish) while we block waiting for that close
        // to complete its work.
        if let Some((_id, slot)) = self.parent_slot.get() {
            slot.done.store(true, Ordering::Release);
        }

        self.close();
    }
}

fn run_context_work(work: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(work)).is_err() {
        tracing::warn!(target: "tether", "context work panicked; the panic was discarded");
    }
}

/// A cancellation scope that owns a serialization domain.
///
/// Every `AoContext` funnels its work through a strand over the executor it
/// was created with, so work delivered through one context (and through its
/// children, which share the *group*) runs serially. Closing the context -
/// explicitly via [`close`][AoContext::close] or implicitly on drop -
/// cancels everything attached to it: queued work is dropped, registered
/// [`CloseHandler`]s fire exactly once in LIFO order, and children close
/// before the parent finishes closing.
///
/// State progresses irreversibly through `Open -> Closing -> Closed`. After
/// close, no callback attached through this context will ever run.
pub struct AoContext {
    core: Arc<ContextCore>,
}

impl fmt::Debug for AoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AoContext")
            .field("group", &self.core.group)
            .field("open", &self.core.is_open())
            .finish()
    }
}

impl AoContext {
    /// Creates a root context bound to `executor`, wrapping it in a strand
    /// unless it already serializes work.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            core: ContextCore::new_root(executor),
        }
    }

    /// Creates a child context.
    ///
    /// The child shares the parent's group (and thus its serialization
    /// domain) and is closed automatically when the parent closes. Fails
    /// with [`Error::ContextClosed`] if the parent is already closing.
    pub fn new_child(&self) -> Result<Self> {
        Ok(Self {
            core: ContextCore::new_child(&self.core)?,
        })
    }

    /// Submits `work` to this context's strand.
    ///
    /// If the context is closed (or closes) before dispatch, the work is
    /// silently dropped. Panics inside `work` are caught and logged.
    pub fn exec(&self, work: impl FnOnce() + Send + 'static, mode: ExecMode) {
        let _ = self.core.exec(work, mode);
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Whether the calling thread is currently executing inside this
    /// context's group.
    pub fn in_this_thread(&self) -> bool {
        self.core.in_this_thread()
    }

    /// The sequence executor this context dispatches through.
    pub fn executor(&self) -> Result<Arc<dyn SequenceExecutor>> {
        self.core.executor()
    }

    /// Registers a close handler. Fails with [`Error::ContextClosed`] once
    /// close has been requested.
    pub fn add_close_handler(&self, handler: Arc<dyn CloseHandler>) -> Result<CloseHandlerId> {
        self.core.add_close_handler(handler)
    }

    /// Detaches a close handler; see [`CloseHandler`] for the guarantees.
    pub fn remove_close_handler(&self, id: CloseHandlerId) {
        self.core.remove_close_handler(id);
    }

    /// Registers `handler` as a close handler, then runs `start`. If
    /// `start` fails the handler is unregistered again and the error is
    /// propagated.
    pub fn start_cancellable(
        &self,
        start: impl FnOnce() -> Result<()>,
        handler: Arc<dyn CloseHandler>,
    ) -> Result<CloseHandlerId> {
        self.core.start_cancellable(start, handler)
    }

    /// Begins close and blocks until the context is `Closed`: in-flight
    /// work drains, close handlers fire, children close first. Idempotent.
    pub fn close(&self) {
        self.core.close();
    }

    /// A non-owning handle to this context for use inside continuations.
    pub fn handle(&self) -> AoContextRef {
        AoContextRef {
            core: Arc::clone(&self.core),
        }
    }
}

impl Drop for AoContext {
    fn drop(&mut self) {
        self.core.close();
    }
}

/// A non-owning reference to an [`AoContext`].
///
/// Unlike the context itself, dropping a reference does not close anything.
/// Continuations and callbacks hold these to deliver work into the context
/// they were bound to.
#[derive(Clone)]
pub struct AoContextRef {
    core: Arc<ContextCore>,
}

impl fmt::Debug for AoContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AoContextRef")
            .field("group", &self.core.group)
            .field("open", &self.core.is_open())
            .finish()
    }
}

impl AoContextRef {
    pub fn exec(&self, work: impl FnOnce() + Send + 'static, mode: ExecMode) {
        let _ = self.core.exec(work, mode);
    }

    /// Like [`exec`][Self::exec], but reports whether the work was
    /// accepted.
    pub(crate) fn exec_checked(&self, work: impl FnOnce() + Send + 'static, mode: ExecMode) -> bool {
        self.core.exec(work, mode)
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub fn in_this_thread(&self) -> bool {
        self.core.in_this_thread()
    }

    pub fn executor(&self) -> Result<Arc<dyn SequenceExecutor>> {
        self.core.executor()
    }

    pub fn add_close_handler(&self, handler: Arc<dyn CloseHandler>) -> Result<CloseHandlerId> {
        self.core.add_close_handler(handler)
    }

    pub fn remove_close_handler(&self, id: CloseHandlerId) {
        self.core.remove_close_handler(id);
    }

    pub fn start_cancellable(
        &self,
        start: impl FnOnce() -> Result<()>,
        handler: Arc<dyn CloseHandler>,
    ) -> Result<CloseHandlerId> {
        self.core.start_cancellable(start, handler)
    }
}

/// Anything that can designate an [`AoContext`] to bind work to: the
/// context itself or a [`AoContextRef`] held by a continuation.
pub trait AsAoContextRef {
    fn ao_ref(&self) -> AoContextRef;
}

impl AsAoContextRef for AoContext {
    fn ao_ref(&self) -> AoContextRef {
        self.handle()
    }
}

impl AsAoContextRef for AoContextRef {
    fn ao_ref(&self) -> AoContextRef {
        self.clone()
    }
}
