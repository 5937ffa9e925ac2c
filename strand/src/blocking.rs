// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The blocking-work thread pool.
//!
//! Synchronous callables (file operations, `spawn_blocking` bodies) run on a
//! small fixed pool of worker threads fed by an injector channel. Workers
//! never touch loop state: each completion is a type-erased boxed result
//! pushed onto a thread-safe queue, and the loop drains that queue at a
//! fixed point in every tick, settling the promises on its own thread. The
//! reactor waker interrupts a sleeping loop when a completion lands.

use core::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{Error, Result};
use crate::event_loop::Handle;
use crate::promise::Promise;

type Payload = Box<dyn Any + Send>;

struct Job {
    id: u64,
    run: Box<dyn FnOnce() -> Payload + Send>,
}

/// Completions posted by workers, drained by the loop each tick.
pub(crate) struct CompletionQueue {
    ready: Mutex<Vec<(u64, Payload)>>,
    waker: Arc<mio::Waker>,
}

/// Loop-side continuation invoked with a worker's payload.
pub(crate) type CompletionContinuation = Box<dyn FnOnce(&Handle, Payload)>;

pub(crate) struct BlockingPool {
    injector: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

// === impl CompletionQueue ===

impl CompletionQueue {
    pub(crate) fn new(waker: Arc<mio::Waker>) -> Self {
        Self {
            ready: Mutex::new(Vec::new()),
            waker,
        }
    }

    fn post(&self, id: u64, payload: Payload) {
        self.ready
            .lock()
            .expect("completion queue poisoned")
            .push((id, payload));
        let _ = self.waker.wake();
    }

    pub(crate) fn take(&self) -> Vec<(u64, Payload)> {
        core::mem::take(&mut *self.ready.lock().expect("completion queue poisoned"))
    }
}

// === impl BlockingPool ===

impl BlockingPool {
    pub(crate) fn new(workers: usize, completions: Arc<CompletionQueue>) -> Self {
        let (injector, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let completions = Arc::clone(&completions);
                thread::Builder::new()
                    .name(format!("strand-blocking-{index}"))
                    .spawn(move || worker_main(&receiver, &completions))
                    .expect("failed to spawn blocking worker")
            })
            .collect();

        Self {
            injector: Some(injector),
            workers,
        }
    }

    fn submit(&self, job: Job) -> core::result::Result<(), ()> {
        match &self.injector {
            Some(injector) => injector.send(job).map_err(|_| ()),
            None => Err(()),
        }
    }

    /// Closes the injector and joins the workers; in-flight jobs finish.
    pub(crate) fn shutdown(&mut self) {
        self.injector = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(receiver: &Mutex<Receiver<Job>>, completions: &CompletionQueue) {
    loop {
        let job = {
            let receiver = receiver.lock().expect("blocking injector poisoned");
            receiver.recv()
        };
        let Ok(job) = job else {
            // injector closed, the loop is shutting down
            return;
        };
        tracing::trace!(op = job.id, "blocking job started");
        let payload = (job.run)();
        completions.post(job.id, payload);
    }
}

// === impl Handle (blocking facade) ===

impl Handle {
    /// Runs a synchronous, fallible callable on the blocking pool and
    /// settles the returned promise from the loop's completion drain.
    ///
    /// This is the seam for CPU-heavy or genuinely blocking work: the loop
    /// keeps turning while the callable runs. Ordering of unrelated
    /// completions is whatever the workers produce; each individual promise
    /// still settles exactly once, on the loop thread.
    pub fn spawn_blocking<T, F>(&self, f: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (promise, settler) = self.promise::<T>();
        let id = self.shared().allocate_op_id();

        self.shared().completion_continuations.borrow_mut().insert(
            id,
            Box::new(move |_handle, payload| {
                let result = payload
                    .downcast::<Result<T>>()
                    .expect("blocking completion payload type mismatch");
                settler.settle(*result);
            }),
        );

        let job = Job {
            id,
            run: Box::new(move || {
                let result: Result<T> = match catch_unwind(AssertUnwindSafe(f)) {
                    Ok(result) => result,
                    Err(payload) => Err(Error::from_panic(payload)),
                };
                Box::new(result)
            }),
        };

        if self.shared().blocking.borrow().submit(job).is_err() {
            self.shared().completion_continuations.borrow_mut().remove(&id);
            return self.rejected(Error::Config("blocking pool is shut down".into()));
        }
        promise
    }
}
