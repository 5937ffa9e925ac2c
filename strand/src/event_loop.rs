// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The single-threaded event loop driver.
//!
//! One tick is: drain the next-tick queue to empty, process one batch of
//! work in a fixed order (expired timers → blocking completions → registered
//! drivers → ready I/O → resumable tasks → deferred callbacks), drain the
//! micro-tasks that batch produced, then block on the reactor for
//! `min(next timer deadline, driver wakeup, IO_WAIT_CAP)`. The loop exits
//! when nothing is ready and nothing is registered to become ready, or when
//! [`Handle::stop`] is called — in which case the current tick finishes
//! first, even with outstanding work.
//!
//! Callback panics are captured and logged; they never unwind through the
//! loop.

use core::cell::{Cell, RefCell};
use core::fmt;
use core::pin::pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Wake, Waker};
use std::time::Instant;

use crate::blocking::{BlockingPool, CompletionContinuation, CompletionQueue};
use crate::combinator::{self, Job};
use crate::error::{Error, Result};
use crate::promise::Promise;
use crate::reactor::Reactor;
use crate::task::{ReadyQueue, TaskTable, run_task};
use crate::time::TimerHeap;

/// Upper bound on a single reactor sleep, so driver wakeups and external
/// completions are never starved for long.
const IO_WAIT_CAP: Duration = Duration::from_millis(250);

/// Workers in the blocking pool that executes file ops and
/// [`Handle::spawn_blocking`] bodies.
const BLOCKING_WORKERS: usize = 4;

type Callback = Box<dyn FnOnce(&Handle)>;

/// A subsystem that multiplexes its own work and is advanced once per tick
/// (the HTTP request manager plugs in here).
pub trait Driver {
    /// Advances the subsystem; returns how many completions it produced.
    fn turn(&mut self, handle: &Handle) -> usize;

    /// How soon the subsystem wants the loop to wake up, if at all.
    fn next_wakeup(&self) -> Option<Duration>;

    /// True while the subsystem has in-flight work that should keep the
    /// loop alive.
    fn has_pending(&self) -> bool;
}

pub(crate) struct LoopShared {
    next_tick: RefCell<VecDeque<Callback>>,
    deferred: RefCell<VecDeque<Callback>>,
    pub(crate) timers: RefCell<TimerHeap>,
    pub(crate) reactor: RefCell<Reactor>,
    pub(crate) tasks: RefCell<TaskTable>,
    pub(crate) ready: Arc<ReadyQueue>,
    pub(crate) completions: Arc<CompletionQueue>,
    pub(crate) completion_continuations: RefCell<HashMap<u64, CompletionContinuation>>,
    pub(crate) blocking: RefCell<BlockingPool>,
    drivers: RefCell<Vec<Rc<RefCell<dyn Driver>>>>,
    stop: Cell<bool>,
    running: Cell<bool>,
    next_op_id: Cell<u64>,
}

impl LoopShared {
    pub(crate) fn allocate_op_id(&self) -> u64 {
        let id = self.next_op_id.get();
        self.next_op_id.set(id + 1);
        id
    }
}

/// A cheaply clonable reference to the event loop.
///
/// All registration APIs hang off this: spawning, timers, watchers, blocking
/// work, promise construction. Handles are loop-local (`!Send`); the
/// singleton facade of the source design maps to passing one of these
/// around, with [`Handle::try_current`] as the in-loop convenience.
#[derive(Clone)]
pub struct Handle {
    shared: Rc<LoopShared>,
}

/// The event loop itself; owns every queue, timer, watcher, and the
/// blocking pool.
pub struct EventLoop {
    shared: Rc<LoopShared>,
}

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

struct EnterGuard {
    prev: Option<Handle>,
}

impl EnterGuard {
    fn enter(handle: Handle) -> Self {
        let prev = CURRENT.with(|current| current.borrow_mut().replace(handle));
        Self { prev }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

/// Waker for the root future of [`EventLoop::block_on`].
struct RootWake {
    woken: AtomicBool,
    unpark: Arc<mio::Waker>,
}

impl Wake for RootWake {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        let _ = self.unpark.wake();
    }
}

// === impl Handle ===

impl Handle {
    pub(crate) fn shared(&self) -> &LoopShared {
        &self.shared
    }

    /// The handle of the loop currently running on this thread.
    pub fn try_current() -> Option<Handle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Like [`Handle::try_current`], but fails with [`Error::NotInTask`]
    /// outside a running loop.
    pub fn current() -> Result<Handle> {
        Handle::try_current().ok_or(Error::NotInTask)
    }

    /// Schedules a micro-task: runs before any other class of work, in
    /// submission order, before the next reactor sleep.
    pub fn next_tick(&self, f: impl FnOnce(&Handle) + 'static) {
        self.shared.next_tick.borrow_mut().push_back(Box::new(f));
    }

    /// Schedules a deferred callback: runs after the current work batch,
    /// before the loop sleeps.
    pub fn defer(&self, f: impl FnOnce(&Handle) + 'static) {
        self.shared.deferred.borrow_mut().push_back(Box::new(f));
    }

    /// Plugs a [`Driver`] into the tick pipeline.
    pub fn register_driver(&self, driver: Rc<RefCell<dyn Driver>>) {
        self.shared.drivers.borrow_mut().push(driver);
    }

    /// Makes the loop exit after the current tick completes, even with
    /// outstanding work.
    pub fn stop(&self) {
        tracing::debug!("loop stop requested");
        self.shared.stop.set(true);
    }

    /// True when no immediate work is queued (micro-tasks, deferreds, ready
    /// tasks); registered timers and watchers do not count.
    pub fn is_idle(&self) -> bool {
        self.shared.next_tick.borrow().is_empty()
            && self.shared.deferred.borrow().is_empty()
            && self.shared.ready.is_empty()
    }

    fn has_pending_sources(&self) -> bool {
        self.shared.timers.borrow().armed_len() > 0
            || self.shared.reactor.borrow().armed_len() > 0
            || !self.shared.completion_continuations.borrow().is_empty()
            || self
                .shared
                .drivers
                .borrow()
                .iter()
                .any(|driver| driver.borrow().has_pending())
    }

    /// `min(next timer deadline, driver wakeup, IO_WAIT_CAP)`.
    fn sleep_budget(&self) -> Duration {
        let mut budget = IO_WAIT_CAP;
        if let Some(deadline) = self.shared.timers.borrow_mut().next_deadline() {
            budget = budget.min(deadline.saturating_duration_since(Instant::now()));
        }
        for driver in &*self.shared.drivers.borrow() {
            if let Some(wakeup) = driver.borrow().next_wakeup() {
                budget = budget.min(wakeup);
            }
        }
        budget
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("idle", &self.is_idle())
            .finish()
    }
}

/// Runs a loop-owned callback, capturing a panic instead of unwinding.
fn run_guarded(handle: &Handle, callback: Callback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(handle))) {
        let err = Error::from_panic(payload);
        tracing::error!(%err, "callback panicked inside the event loop");
    }
}

// === impl EventLoop ===

impl EventLoop {
    /// Builds a loop with its reactor and blocking pool.
    pub fn new() -> Result<Self> {
        let reactor = Reactor::new()
            .map_err(|err| Error::Config(format!("failed to initialize reactor: {err}")))?;
        let unpark = reactor.unpark_handle();
        let completions = Arc::new(CompletionQueue::new(Arc::clone(&unpark)));

        let shared = Rc::new(LoopShared {
            next_tick: RefCell::new(VecDeque::new()),
            deferred: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerHeap::new()),
            reactor: RefCell::new(reactor),
            tasks: RefCell::new(TaskTable::new()),
            ready: Arc::new(ReadyQueue::new(Arc::clone(&unpark))),
            completions: Arc::clone(&completions),
            completion_continuations: RefCell::new(HashMap::new()),
            blocking: RefCell::new(BlockingPool::new(BLOCKING_WORKERS, completions)),
            drivers: RefCell::new(Vec::new()),
            stop: Cell::new(false),
            running: Cell::new(false),
            next_op_id: Cell::new(1),
        });

        Ok(Self { shared })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: Rc::clone(&self.shared),
        }
    }

    /// Drives the loop until `future` completes.
    ///
    /// Returns `Err(Error::Cancelled)` if [`Handle::stop`] fires first.
    ///
    /// # Panics
    ///
    /// Panics if the loop is already running (re-entrant `block_on`), or if
    /// the root future is pending while the loop has nothing registered that
    /// could ever wake it — a deadlock, which is a programmer error.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let handle = self.handle();
        let _enter = self.start_running(&handle);

        let root = Arc::new(RootWake {
            woken: AtomicBool::new(true),
            unpark: self.shared.reactor.borrow().unpark_handle(),
        });
        let waker = Waker::from(Arc::clone(&root));
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if root.woken.swap(false, Ordering::AcqRel)
                && let Poll::Ready(output) = future.as_mut().poll(&mut cx)
            {
                return Ok(output);
            }

            let progress = self.turn(&handle);

            if self.shared.stop.get() {
                tracing::debug!("loop stopped with the root future still pending");
                return Err(Error::Cancelled);
            }
            if progress > 0 || root.woken.load(Ordering::Acquire) {
                continue;
            }

            assert!(
                handle.has_pending_sources(),
                "event loop deadlock: the root future is pending but no timer, watcher, \
                 driver, or blocking operation is registered to wake it"
            );

            self.sleep(&handle);
        }
    }

    /// Drives the loop until no work is queued and nothing is registered to
    /// produce more, or until [`Handle::stop`].
    pub fn run_until_idle(&self) {
        let handle = self.handle();
        let _enter = self.start_running(&handle);

        loop {
            let progress = self.turn(&handle);
            if self.shared.stop.get() {
                tracing::debug!("loop stopped by request");
                return;
            }
            if progress > 0 {
                continue;
            }
            if !handle.has_pending_sources() {
                tracing::trace!("loop idle, exiting");
                return;
            }
            self.sleep(&handle);
        }
    }

    /// Runs one operation to completion (the loop-facing `run`).
    pub fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Clone + 'static,
        F: FnOnce(&Handle) -> Promise<T>,
    {
        let handle = self.handle();
        let promise = op(&handle);
        self.block_on(promise)?
    }

    /// Runs every operation concurrently; results preserve input order.
    pub fn run_all<T: Clone + 'static>(&self, ops: Vec<Job<T>>) -> Result<Vec<T>> {
        let handle = self.handle();
        let promise = combinator::all(&handle, ops);
        self.block_on(promise)?
    }

    /// Runs operations with at most `limit` in flight.
    pub fn run_concurrent<T: Clone + 'static>(
        &self,
        ops: Vec<Job<T>>,
        limit: usize,
    ) -> Result<Vec<T>> {
        let handle = self.handle();
        let promise = combinator::concurrent(&handle, ops, limit);
        self.block_on(promise)?
    }

    /// Runs operations in batches of `size`, each batch with `concurrency`
    /// in flight (defaults to the batch size).
    pub fn run_batch<T: Clone + 'static>(
        &self,
        ops: Vec<Job<T>>,
        size: usize,
        concurrency: Option<usize>,
    ) -> Result<Vec<T>> {
        let handle = self.handle();
        let promise = combinator::batch(&handle, ops, size, concurrency);
        self.block_on(promise)?
    }

    /// Runs one operation with a deadline.
    pub fn run_with_timeout<T, F>(&self, op: F, window: Duration) -> Result<T>
    where
        T: Clone + 'static,
        F: FnOnce(&Handle) -> Promise<T>,
    {
        let handle = self.handle();
        let promise = combinator::timeout(&handle, op(&handle), window);
        self.block_on(promise)?
    }

    /// Runs one operation and reports its wall-clock duration.
    pub fn benchmark<T, F>(&self, op: F) -> Result<(T, Duration)>
    where
        T: Clone + 'static,
        F: FnOnce(&Handle) -> Promise<T>,
    {
        let started = Instant::now();
        let result = self.run(op)?;
        Ok((result, started.elapsed()))
    }

    fn start_running(&self, _handle: &Handle) -> (EnterGuard, RunningGuard<'_>) {
        assert!(
            !self.shared.running.get(),
            "event loop started re-entrantly from inside itself"
        );
        self.shared.running.set(true);
        self.shared.stop.set(false);
        (
            EnterGuard::enter(self.handle()),
            RunningGuard {
                shared: &self.shared,
            },
        )
    }

    /// One tick's worth of work. Returns the number of callbacks run.
    fn turn(&self, handle: &Handle) -> usize {
        let mut progress = 0;

        progress += self.drain_next_tick(handle);

        // Fixed batch order: timers, blocking completions, drivers, ready
        // I/O, resumable tasks, deferreds.
        let fired = self.shared.timers.borrow_mut().expire(Instant::now());
        progress += fired.len();
        for callback in fired {
            run_guarded(handle, callback);
        }

        for (id, payload) in self.shared.completions.take() {
            let continuation = self.shared.completion_continuations.borrow_mut().remove(&id);
            if let Some(continuation) = continuation {
                progress += 1;
                if let Err(p) =
                    catch_unwind(AssertUnwindSafe(|| continuation(handle, payload)))
                {
                    let err = Error::from_panic(p);
                    tracing::error!(%err, "completion continuation panicked");
                }
            }
        }

        let drivers: Vec<_> = self.shared.drivers.borrow().clone();
        for driver in drivers {
            progress += driver.borrow_mut().turn(handle);
        }

        progress += self.dispatch_io(handle, Some(Duration::ZERO));

        for id in self.shared.ready.take_batch() {
            if run_task(handle, id) {
                progress += 1;
            }
        }

        let deferred: Vec<Callback> = {
            let mut queue = self.shared.deferred.borrow_mut();
            queue.drain(..).collect()
        };
        progress += deferred.len();
        for callback in deferred {
            run_guarded(handle, callback);
        }

        // micro-tasks produced by the batch run before any sleep
        progress += self.drain_next_tick(handle);

        progress
    }

    fn drain_next_tick(&self, handle: &Handle) -> usize {
        let mut count = 0;
        loop {
            let callback = self.shared.next_tick.borrow_mut().pop_front();
            let Some(callback) = callback else { break };
            run_guarded(handle, callback);
            count += 1;
        }
        count
    }

    fn dispatch_io(&self, handle: &Handle, timeout: Option<Duration>) -> usize {
        let fired = match self.shared.reactor.borrow_mut().poll(timeout) {
            Ok(fired) => fired,
            Err(err) => {
                tracing::error!(%err, "reactor poll failed");
                return 0;
            }
        };
        let count = fired.len();
        for callback in fired {
            run_guarded(handle, callback);
        }
        count
    }

    fn sleep(&self, handle: &Handle) {
        let budget = handle.sleep_budget();
        tracing::trace!(?budget, "going to sleep");
        self.dispatch_io(handle, Some(budget));
    }
}

struct RunningGuard<'a> {
    shared: &'a LoopShared,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.shared.running.set(false);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shared.blocking.borrow_mut().shutdown();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("tasks", &self.shared.tasks.borrow().len())
            .field("timers", &self.shared.timers.borrow().armed_len())
            .finish()
    }
}
