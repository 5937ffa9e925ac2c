// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Suspendable tasks and the ready queue.
//!
//! A task is a spawned future bound to a result [`Promise`]. Its waker pushes
//! the task id onto the loop's ready queue (and kicks the reactor waker so a
//! sleeping loop wakes up); the scheduler drains one batch per tick, so a
//! task that re-readies itself while running is resumed on the *next* tick,
//! never recursively.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::task::{Wake, Waker};

use crate::error::{Error, Result};
use crate::event_loop::Handle;
use crate::promise::Promise;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(u64);

struct TaskEntry {
    future: Pin<Box<dyn Future<Output = ()>>>,
    /// Rejects the task's result promise if the body panics mid-poll.
    on_panic: Option<Box<dyn FnOnce(Error)>>,
}

pub(crate) struct TaskTable {
    tasks: HashMap<TaskId, TaskEntry>,
    next_id: u64,
}

/// Cross-thread injector: wakers push ready task ids here, the loop drains
/// a batch per tick. The only shared state a waker touches.
pub(crate) struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
    waker: Arc<mio::Waker>,
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

// === impl TaskTable ===

impl TaskTable {
    pub(crate) fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, entry: TaskEntry) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, entry);
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

// === impl ReadyQueue ===

impl ReadyQueue {
    pub(crate) fn new(waker: Arc<mio::Waker>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    pub(crate) fn push(&self, id: TaskId) {
        self.queue.lock().expect("ready queue poisoned").push_back(id);
        let _ = self.waker.wake();
    }

    /// Takes the current batch; ids pushed while the batch runs wait for the
    /// next tick.
    pub(crate) fn take_batch(&self) -> Vec<TaskId> {
        let mut queue = self.queue.lock().expect("ready queue poisoned");
        queue.drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().expect("ready queue poisoned").is_empty()
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

// === impl Handle (spawning) ===

impl Handle {
    /// Spawns `future` as a task; the returned promise fulfils with its
    /// output. A panic in the body rejects the promise with
    /// [`Error::Panicked`] instead of unwinding into the loop.
    pub fn spawn<F>(&self, future: F) -> Promise<F::Output>
    where
        F: Future + 'static,
        F::Output: Clone + 'static,
    {
        let (promise, settler) = self.promise::<F::Output>();
        let completion = settler.clone();
        self.spawn_raw(
            async move {
                completion.fulfil(future.await);
            },
            Box::new(move |err| settler.reject(err)),
        );
        promise
    }

    /// Spawns a fallible body: an `Err` output becomes a rejection, so task
    /// errors and promise rejections are one channel.
    pub fn try_spawn<F, T>(&self, future: F) -> Promise<T>
    where
        F: Future<Output = Result<T>> + 'static,
        T: Clone + 'static,
    {
        let (promise, settler) = self.promise::<T>();
        let completion = settler.clone();
        self.spawn_raw(
            async move {
                completion.settle(future.await);
            },
            Box::new(move |err| settler.reject(err)),
        );
        promise
    }

    fn spawn_raw(&self, future: impl Future<Output = ()> + 'static, on_panic: Box<dyn FnOnce(Error)>) {
        let id = self.shared().tasks.borrow_mut().insert(TaskEntry {
            future: Box::pin(future),
            on_panic: Some(on_panic),
        });
        tracing::trace!(task = id.0, "task spawned");
        self.shared().ready.push(id);
    }
}

/// Resumes one task: polls it with its waker, catching panics.
///
/// Returns `true` if the id named a live task.
pub(crate) fn run_task(handle: &Handle, id: TaskId) -> bool {
    // The entry is taken out of the table while it runs so the poll can
    // spawn, wake, or drop other tasks without re-borrowing.
    let Some(mut entry) = handle.shared().tasks.borrow_mut().tasks.remove(&id) else {
        return false;
    };

    let waker = Waker::from(Arc::new(TaskWaker {
        id,
        ready: Arc::clone(&handle.shared().ready),
    }));
    let mut cx = Context::from_waker(&waker);

    match catch_unwind(AssertUnwindSafe(|| entry.future.as_mut().poll(&mut cx))) {
        Ok(Poll::Pending) => {
            handle.shared().tasks.borrow_mut().tasks.insert(id, entry);
        }
        Ok(Poll::Ready(())) => {
            tracing::trace!(task = id.0, "task completed");
        }
        Err(payload) => {
            let err = Error::from_panic(payload);
            tracing::error!(task = id.0, %err, "task panicked");
            if let Some(on_panic) = entry.on_panic.take() {
                on_panic(err);
            }
        }
    }
    true
}
