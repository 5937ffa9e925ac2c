// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Promise combinators: `all`, `race`, `any`, `concurrent`, `batch`,
//! `timeout`.
//!
//! Inputs are [`Job`]s — either an already-running promise or a zero-arg
//! callable producing one — normalized at entry. Results always preserve
//! input order, regardless of completion order.

use core::cell::RefCell;
use core::time::Duration;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::event_loop::Handle;
use crate::promise::{Promise, Settler, catch_handler_panic};

/// A combinator input: a promise already in flight, or a lazy callable
/// started by the combinator itself (`concurrent`/`batch` start lazies only
/// when a slot frees up).
pub enum Job<T> {
    Promise(Promise<T>),
    Lazy(Box<dyn FnOnce(&Handle) -> Promise<T>>),
}

impl<T: Clone + 'static> Job<T> {
    /// Wraps a callable; it runs when the combinator gives it a slot.
    pub fn lazy(f: impl FnOnce(&Handle) -> Promise<T> + 'static) -> Self {
        Job::Lazy(Box::new(f))
    }

    /// Starts the job; a panic inside a lazy callable becomes a rejected
    /// promise rather than unwinding into the combinator.
    fn start(self, handle: &Handle) -> Promise<T> {
        match self {
            Job::Promise(promise) => promise,
            Job::Lazy(f) => match catch_handler_panic(|| f(handle)) {
                Ok(promise) => promise,
                Err(err) => handle.rejected(err),
            },
        }
    }
}

impl<T> From<Promise<T>> for Job<T> {
    fn from(promise: Promise<T>) -> Self {
        Job::Promise(promise)
    }
}

/// Fulfils with every value in input order; rejects on the first rejection
/// without waiting for — or cancelling — the rest.
pub fn all<T: Clone + 'static>(handle: &Handle, jobs: Vec<Job<T>>) -> Promise<Vec<T>> {
    let (promise, settler) = handle.promise::<Vec<T>>();
    let total = jobs.len();
    if total == 0 {
        settler.fulfil(Vec::new());
        return promise;
    }

    let results: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; total]));
    let remaining = Rc::new(RefCell::new(total));

    for (index, job) in jobs.into_iter().enumerate() {
        let results = Rc::clone(&results);
        let remaining = Rc::clone(&remaining);
        let settler = settler.clone();
        job.start(handle).subscribe(move |_handle, result| match result {
            Ok(value) => {
                results.borrow_mut()[index] = Some(value);
                let mut remaining = remaining.borrow_mut();
                *remaining -= 1;
                if *remaining == 0 {
                    let values = results
                        .borrow_mut()
                        .iter_mut()
                        .map(|slot| slot.take().expect("all slots filled"))
                        .collect();
                    settler.fulfil(values);
                }
            }
            Err(err) => settler.reject(err),
        });
    }
    promise
}

/// Settles with the first settlement, fulfilment or rejection.
pub fn race<T: Clone + 'static>(handle: &Handle, jobs: Vec<Job<T>>) -> Promise<T> {
    let (promise, settler) = handle.promise::<T>();
    for job in jobs {
        let settler = settler.clone();
        job.start(handle)
            .subscribe(move |_handle, result| settler.settle(result));
    }
    promise
}

/// Fulfils with the first fulfilment; rejects only once every input has
/// rejected, with [`Error::Aggregate`] preserving input order.
pub fn any<T: Clone + 'static>(handle: &Handle, jobs: Vec<Job<T>>) -> Promise<T> {
    let (promise, settler) = handle.promise::<T>();
    let total = jobs.len();
    if total == 0 {
        settler.reject(Error::Aggregate(Vec::new()));
        return promise;
    }

    let errors: Rc<RefCell<Vec<Option<Error>>>> = Rc::new(RefCell::new(vec![None; total]));
    let rejected = Rc::new(RefCell::new(0_usize));

    for (index, job) in jobs.into_iter().enumerate() {
        let errors = Rc::clone(&errors);
        let rejected = Rc::clone(&rejected);
        let settler = settler.clone();
        job.start(handle).subscribe(move |_handle, result| match result {
            Ok(value) => settler.fulfil(value),
            Err(err) => {
                errors.borrow_mut()[index] = Some(err);
                let mut rejected = rejected.borrow_mut();
                *rejected += 1;
                if *rejected == total {
                    let reasons = errors
                        .borrow_mut()
                        .iter_mut()
                        .map(|slot| slot.take().expect("all reasons recorded"))
                        .collect();
                    settler.reject(Error::Aggregate(reasons));
                }
            }
        });
    }
    promise
}

struct ConcurrentState<T> {
    pending: VecDeque<(usize, Job<T>)>,
    in_flight: Vec<Promise<T>>,
    results: Vec<Option<T>>,
    remaining: usize,
    limit: usize,
    failed: bool,
}

/// Runs jobs with at most `limit` in flight. Fails fast on the first
/// rejection and attempts to cancel every outstanding cancellable; jobs
/// whose slot never came are simply not started. Results preserve input
/// order.
pub fn concurrent<T: Clone + 'static>(
    handle: &Handle,
    jobs: Vec<Job<T>>,
    limit: usize,
) -> Promise<Vec<T>> {
    let (promise, settler) = handle.promise::<Vec<T>>();
    let total = jobs.len();
    if total == 0 {
        settler.fulfil(Vec::new());
        return promise;
    }

    let state = Rc::new(RefCell::new(ConcurrentState {
        pending: jobs.into_iter().enumerate().collect(),
        in_flight: Vec::new(),
        results: vec![None; total],
        remaining: total,
        limit: limit.max(1),
        failed: false,
    }));
    pump_concurrent(handle, &state, &settler);
    promise
}

fn pump_concurrent<T: Clone + 'static>(
    handle: &Handle,
    state: &Rc<RefCell<ConcurrentState<T>>>,
    settler: &Settler<Vec<T>>,
) {
    loop {
        let (index, job) = {
            let mut s = state.borrow_mut();
            if s.failed || s.in_flight.len() >= s.limit {
                return;
            }
            let Some(entry) = s.pending.pop_front() else {
                return;
            };
            entry
        };

        let started = job.start(handle);
        state.borrow_mut().in_flight.push(started.clone());

        let state = Rc::clone(state);
        let settler = settler.clone();
        let watched = started.clone();
        watched.subscribe(move |handle, result| {
            {
                let mut s = state.borrow_mut();
                if s.failed {
                    return;
                }
                s.in_flight.retain(|p| !p.ptr_eq(&started));
                match result {
                    Ok(value) => {
                        s.results[index] = Some(value);
                        s.remaining -= 1;
                        if s.remaining == 0 {
                            let values = s
                                .results
                                .iter_mut()
                                .map(|slot| slot.take().expect("all slots filled"))
                                .collect();
                            settler.fulfil(values);
                            return;
                        }
                    }
                    Err(err) => {
                        s.failed = true;
                        settler.reject(err);
                        for outstanding in s.in_flight.drain(..) {
                            outstanding.cancel();
                        }
                        return;
                    }
                }
            }
            pump_concurrent(handle, &state, &settler);
        });
    }
}

/// Splits jobs into batches of `size`; batches run one after another, each
/// with `concurrency` (default: the batch size) in flight. Results
/// concatenate in input order.
pub fn batch<T: Clone + 'static>(
    handle: &Handle,
    jobs: Vec<Job<T>>,
    size: usize,
    concurrency: Option<usize>,
) -> Promise<Vec<T>> {
    let (promise, settler) = handle.promise::<Vec<T>>();
    let size = size.max(1);
    let concurrency = concurrency.unwrap_or(size).max(1);

    let mut batches: VecDeque<Vec<Job<T>>> = VecDeque::new();
    let mut jobs = jobs.into_iter();
    loop {
        let chunk: Vec<Job<T>> = jobs.by_ref().take(size).collect();
        if chunk.is_empty() {
            break;
        }
        batches.push_back(chunk);
    }

    run_next_batch(handle, batches, Vec::new(), concurrency, settler);
    promise
}

fn run_next_batch<T: Clone + 'static>(
    handle: &Handle,
    mut batches: VecDeque<Vec<Job<T>>>,
    mut collected: Vec<T>,
    concurrency: usize,
    settler: Settler<Vec<T>>,
) {
    let Some(next) = batches.pop_front() else {
        settler.fulfil(collected);
        return;
    };
    concurrent(handle, next, concurrency).subscribe(move |handle, result| match result {
        Ok(values) => {
            collected.extend(values);
            run_next_batch(handle, batches, collected, concurrency, settler);
        }
        Err(err) => settler.reject(err),
    });
}

/// Resolves with the promise's outcome if it settles within `window`;
/// otherwise rejects [`Error::Timeout`] and cancels the promise if it is
/// cancellable.
pub fn timeout<T: Clone + 'static>(
    handle: &Handle,
    promise: Promise<T>,
    window: Duration,
) -> Promise<T> {
    let (out, settler) = handle.promise::<T>();
    if let Some(root) = promise.cancel_handle() {
        out.set_root(root);
    }

    let timer = {
        let settler = settler.clone();
        let watched = promise.clone();
        handle.add_timer(window, move |_handle| {
            tracing::trace!(?window, "promise timed out");
            settler.reject(Error::Timeout(window));
            watched.cancel();
        })
    };

    promise.subscribe(move |handle, result: Result<T>| {
        handle.cancel_timer(timer);
        settler.settle(result);
    });
    out
}
