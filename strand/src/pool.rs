// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Generic bounded resource pool with FIFO waiters and cancellable racing
//! transactions.
//!
//! Acquire order: reuse an idle resource (discarding expired or invalid
//! ones), create under `max`, otherwise join the FIFO waiter queue.
//! Conservation holds on every path: `acquired - released == in_use`, and
//! a closed pool hands out nothing.

use core::cell::{Cell, RefCell};
use core::fmt;
use core::time::Duration;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::error::Error;
use crate::event_loop::Handle;
use crate::promise::{Promise, Settler, catch_handler_panic};

/// Creates, validates, and recycles pooled resources.
pub trait ResourceFactory<R> {
    /// Creates a fresh resource; rejections surface to the acquiring caller.
    fn create(&self, handle: &Handle) -> Promise<R>;

    /// Health check applied on acquire and release; `false` destroys the
    /// resource.
    fn validate(&self, _resource: &R) -> bool {
        true
    }

    /// Reset/rollback hook applied whenever a resource returns to the pool
    /// (including racing-transaction losers).
    fn recycle(&self, _resource: &mut R) {}
}

/// Pool sizing and expiry knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Resources pre-created at pool construction.
    pub min: usize,
    pub max: usize,
    /// Idle resources older than this are discarded on acquire.
    pub idle_timeout: Option<Duration>,
    /// Resources older than this are discarded on acquire.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 10,
            idle_timeout: None,
            max_lifetime: None,
        }
    }
}

/// Conservation counters; see [`Pool::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    pub discarded: u64,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
}

struct Idle<R> {
    resource: R,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<R: Clone + 'static> {
    available: VecDeque<Idle<R>>,
    in_use: usize,
    creating: usize,
    waiters: VecDeque<Settler<PoolGuard<R>>>,
    closed: bool,
}

struct Counters {
    created: Cell<u64>,
    acquired: Cell<u64>,
    released: Cell<u64>,
    discarded: Cell<u64>,
}

struct PoolInner<R: Clone + 'static> {
    handle: Handle,
    factory: Box<dyn ResourceFactory<R>>,
    config: PoolConfig,
    state: RefCell<PoolState<R>>,
    counters: Counters,
}

/// A shared handle to the pool.
pub struct Pool<R: Clone + 'static> {
    inner: Rc<PoolInner<R>>,
}

impl<R: Clone + 'static> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// A checked-out resource. Clones share the checkout; the resource returns
/// to the pool on explicit [`Pool::release`]/[`Pool::discard`], or when the
/// last clone drops.
pub struct PoolGuard<R: Clone + 'static> {
    inner: Rc<GuardInner<R>>,
}

impl<R: Clone + 'static> Clone for PoolGuard<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

struct GuardInner<R: Clone + 'static> {
    resource: RefCell<Option<R>>,
    created_at: Instant,
    pool: Weak<PoolInner<R>>,
}

/// A transaction body for [`Pool::race`].
pub type TransactionFn<R, T> = Box<dyn FnOnce(&Handle, PoolGuard<R>) -> Promise<T>>;

// === impl Pool ===

impl<R: Clone + 'static> Pool<R> {
    /// Builds the pool and pre-creates `config.min` resources.
    pub fn new(
        handle: &Handle,
        factory: impl ResourceFactory<R> + 'static,
        config: PoolConfig,
    ) -> Self {
        let pool = Self {
            inner: Rc::new(PoolInner {
                handle: handle.clone(),
                factory: Box::new(factory),
                config,
                state: RefCell::new(PoolState {
                    available: VecDeque::new(),
                    in_use: 0,
                    creating: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
                counters: Counters {
                    created: Cell::new(0),
                    acquired: Cell::new(0),
                    released: Cell::new(0),
                    discarded: Cell::new(0),
                },
            }),
        };
        for _ in 0..pool.inner.config.min {
            spawn_create(&pool.inner, None);
        }
        pool
    }

    /// Acquires a resource: idle reuse, creation under `max`, or a FIFO
    /// waiter slot. Rejects [`Error::PoolClosed`] on a closed pool.
    pub fn get(&self) -> Promise<PoolGuard<R>> {
        let inner = &self.inner;
        if inner.state.borrow().closed {
            return inner.handle.rejected(Error::PoolClosed);
        }

        // (1) reuse an idle resource, discarding stale or invalid ones
        loop {
            let idle = {
                let mut state = inner.state.borrow_mut();
                let Some(idle) = state.available.pop_front() else {
                    break;
                };
                idle
            };
            if self.expired(&idle) || !inner.factory.validate(&idle.resource) {
                inner.counters.discarded.set(inner.counters.discarded.get() + 1);
                drop(idle);
                continue;
            }
            let guard = check_out(inner, idle.resource, idle.created_at);
            return inner.handle.resolved(guard);
        }

        let (promise, settler) = inner.handle.promise::<PoolGuard<R>>();
        let room = {
            let state = inner.state.borrow();
            state.in_use + state.creating + state.available.len() < inner.config.max
        };
        if room {
            // (2) create a replacement for this caller
            spawn_create(inner, Some(settler));
        } else {
            // (3) FIFO waiter
            inner.state.borrow_mut().waiters.push_back(settler);
        }
        promise
    }

    /// Returns a healthy resource: recycled, then handed to the oldest
    /// waiter or parked idle.
    ///
    /// # Panics
    ///
    /// Panics if the guard was already released — releasing a resource you
    /// no longer own is a programmer error.
    pub fn release(&self, guard: PoolGuard<R>) {
        let resource = guard
            .inner
            .resource
            .borrow_mut()
            .take()
            .expect("released a pool resource that was already released");
        give_back(&self.inner, resource, guard.inner.created_at, true);
    }

    /// Destroys an unhealthy resource and backfills waiters if any.
    ///
    /// # Panics
    ///
    /// Panics if the guard was already released.
    pub fn discard(&self, guard: PoolGuard<R>) {
        let resource = guard
            .inner
            .resource
            .borrow_mut()
            .take()
            .expect("discarded a pool resource that was already released");
        give_back(&self.inner, resource, guard.inner.created_at, false);
    }

    /// Closes the pool: destroys idle resources, rejects waiters with
    /// [`Error::PoolClosed`]; later [`Pool::get`] calls reject the same.
    /// In-use resources are destroyed as they come back.
    pub fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<Idle<R>> = state.available.drain(..).collect();
            let waiters: Vec<Settler<PoolGuard<R>>> = state.waiters.drain(..).collect();
            (idle, waiters)
        };
        tracing::debug!(
            destroyed = idle.len(),
            rejected = waiters.len(),
            "pool closed"
        );
        let counters = &self.inner.counters;
        counters
            .discarded
            .set(counters.discarded.get() + idle.len() as u64);
        drop(idle);
        for waiter in waiters {
            waiter.reject(Error::PoolClosed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.borrow();
        let counters = &self.inner.counters;
        PoolStats {
            created: counters.created.get(),
            acquired: counters.acquired.get(),
            released: counters.released.get(),
            discarded: counters.discarded.get(),
            in_use: state.in_use,
            idle: state.available.len(),
            waiting: state.waiters.len(),
        }
    }

    /// Races `transactions`, each holding its own pooled resource.
    ///
    /// The first fulfilment wins; every other in-flight transaction promise
    /// is cancelled. Win or lose, each participant's resource is recycled
    /// (the factory's rollback hook) and returned when its transaction
    /// settles, so no outcome leaks a resource. If every transaction
    /// rejects, the race rejects with [`Error::Aggregate`] in input order.
    pub fn race<T: Clone + 'static>(&self, transactions: Vec<TransactionFn<R, T>>) -> Promise<T> {
        let handle = self.inner.handle.clone();
        let (promise, settler) = handle.promise::<T>();
        let total = transactions.len();
        if total == 0 {
            settler.reject(Error::Aggregate(Vec::new()));
            return promise;
        }

        let won = Rc::new(Cell::new(false));
        let errors: Rc<RefCell<Vec<Option<Error>>>> = Rc::new(RefCell::new(vec![None; total]));
        let settled = Rc::new(Cell::new(0_usize));
        let in_flight: Rc<RefCell<Vec<Promise<T>>>> = Rc::new(RefCell::new(Vec::new()));

        for (index, transaction) in transactions.into_iter().enumerate() {
            let pool = self.clone();
            let won = Rc::clone(&won);
            let errors = Rc::clone(&errors);
            let settled = Rc::clone(&settled);
            let in_flight = Rc::clone(&in_flight);
            let settler = settler.clone();

            self.get().subscribe(move |handle, acquired| {
                let guard = match acquired {
                    Ok(guard) => guard,
                    Err(err) => {
                        record_loss(&errors, &settled, &won, &settler, index, err, total);
                        return;
                    }
                };
                if won.get() {
                    // the race is already decided, give the slot straight back
                    pool.release(guard);
                    return;
                }

                let body = {
                    let guard = guard.clone();
                    catch_handler_panic(move || transaction(handle, guard))
                };
                let transacting = match body {
                    Ok(promise) => promise,
                    Err(panic) => {
                        pool.release(guard);
                        record_loss(&errors, &settled, &won, &settler, index, panic, total);
                        return;
                    }
                };
                in_flight.borrow_mut().push(transacting.clone());

                transacting.subscribe(move |_handle, outcome| {
                    // rollback hook runs inside release via recycle
                    pool.release(guard);
                    match outcome {
                        Ok(value) => {
                            if !won.replace(true) {
                                settler.fulfil(value);
                                for loser in in_flight.borrow_mut().drain(..) {
                                    loser.cancel();
                                }
                            }
                        }
                        Err(err) => {
                            record_loss(&errors, &settled, &won, &settler, index, err, total);
                        }
                    }
                });
            });
        }
        promise
    }

    fn expired(&self, idle: &Idle<R>) -> bool {
        let now = Instant::now();
        if let Some(lifetime) = self.inner.config.max_lifetime
            && now.duration_since(idle.created_at) > lifetime
        {
            return true;
        }
        if let Some(idle_timeout) = self.inner.config.idle_timeout
            && now.duration_since(idle.idle_since) > idle_timeout
        {
            return true;
        }
        false
    }
}

fn record_loss<T: Clone + 'static>(
    errors: &Rc<RefCell<Vec<Option<Error>>>>,
    settled: &Rc<Cell<usize>>,
    won: &Rc<Cell<bool>>,
    settler: &Settler<T>,
    index: usize,
    err: Error,
    total: usize,
) {
    errors.borrow_mut()[index] = Some(err);
    settled.set(settled.get() + 1);
    if settled.get() == total && !won.get() {
        let reasons = errors
            .borrow_mut()
            .iter_mut()
            .map(|slot| slot.take().unwrap_or(Error::Cancelled))
            .collect();
        settler.reject(Error::Aggregate(reasons));
    }
}

/// Hands a resource out, updating counters.
fn check_out<R: Clone + 'static>(inner: &Rc<PoolInner<R>>, resource: R, created_at: Instant) -> PoolGuard<R> {
    let mut state = inner.state.borrow_mut();
    state.in_use += 1;
    inner.counters.acquired.set(inner.counters.acquired.get() + 1);
    PoolGuard {
        inner: Rc::new(GuardInner {
            resource: RefCell::new(Some(resource)),
            created_at,
            pool: Rc::downgrade(inner),
        }),
    }
}

/// Creates a resource via the factory; delivers it to `deliver_to` if set
/// (an acquiring caller), otherwise to the oldest live waiter or the idle
/// deque.
fn spawn_create<R: Clone + 'static>(inner: &Rc<PoolInner<R>>, deliver_to: Option<Settler<PoolGuard<R>>>) {
    inner.state.borrow_mut().creating += 1;
    let weak = Rc::downgrade(inner);
    inner
        .factory
        .create(&inner.handle)
        .subscribe(move |_handle, result| {
            let Some(inner) = weak.upgrade() else { return };
            inner.state.borrow_mut().creating -= 1;
            match result {
                Ok(resource) => {
                    inner.counters.created.set(inner.counters.created.get() + 1);
                    match deliver_to {
                        Some(settler) if !settler.is_abandoned() => {
                            let guard = check_out(&inner, resource, Instant::now());
                            settler.fulfil(guard);
                        }
                        _ => offer(&inner, resource, Instant::now()),
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, "pool factory create failed");
                    if let Some(settler) = deliver_to {
                        settler.reject(err);
                    }
                }
            }
        });
}

/// Returns a resource to the pool after use (or destroys it).
fn give_back<R: Clone + 'static>(inner: &Rc<PoolInner<R>>, mut resource: R, created_at: Instant, healthy: bool) {
    {
        let mut state = inner.state.borrow_mut();
        state.in_use -= 1;
    }
    inner.counters.released.set(inner.counters.released.get() + 1);

    let closed = inner.state.borrow().closed;
    if closed || !healthy || !inner.factory.validate(&resource) {
        inner.counters.discarded.set(inner.counters.discarded.get() + 1);
        drop(resource);
        // backfill waiters that are still owed a resource
        let has_waiters = !inner.state.borrow().waiters.is_empty();
        if !closed && has_waiters {
            spawn_create(inner, None);
        }
        return;
    }

    inner.factory.recycle(&mut resource);
    offer(inner, resource, created_at);
}

/// Hands a live resource to the oldest live waiter, else parks it idle.
fn offer<R: Clone + 'static>(inner: &Rc<PoolInner<R>>, resource: R, created_at: Instant) {
    loop {
        let waiter = inner.state.borrow_mut().waiters.pop_front();
        match waiter {
            Some(settler) if settler.is_abandoned() => {}
            Some(settler) => {
                let guard = check_out(inner, resource, created_at);
                settler.fulfil(guard);
                return;
            }
            None => break,
        }
    }
    inner.state.borrow_mut().available.push_back(Idle {
        resource,
        created_at,
        idle_since: Instant::now(),
    });
}

impl<R: Clone + 'static> Drop for GuardInner<R> {
    fn drop(&mut self) {
        // safety net: an un-released guard returns its resource on last drop
        if let Some(resource) = self.resource.borrow_mut().take()
            && let Some(inner) = self.pool.upgrade()
        {
            tracing::trace!("pool guard dropped without release, returning resource");
            give_back(&inner, resource, self.created_at, true);
        }
    }
}

impl<R: Clone + 'static> PoolGuard<R> {
    /// Runs `f` with mutable access to the resource.
    ///
    /// # Panics
    ///
    /// Panics if the guard was already released.
    pub fn with<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        let mut resource = self.inner.resource.borrow_mut();
        let resource = resource
            .as_mut()
            .expect("used a pool resource after releasing it");
        f(resource)
    }

    /// True until the resource is handed back.
    pub fn is_live(&self) -> bool {
        self.inner.resource.borrow().is_some()
    }
}

impl<R: Clone + 'static> fmt::Debug for PoolGuard<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolGuard")
            .field("live", &self.inner.resource.borrow().is_some())
            .finish()
    }
}

impl<R: Clone + 'static> fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Pool")
            .field("idle", &state.available.len())
            .field("in_use", &state.in_use)
            .field("waiting", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}
