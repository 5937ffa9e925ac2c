// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fair, non-reentrant async mutex.
//!
//! Waiters acquire strictly in enqueue order: releasing hands the lock to
//! the head of the queue, never to a late-arriving `lock` call. There is no
//! built-in timeout; compose with [`crate::combinator::timeout`].

use core::cell::{Cell, RefCell};
use core::fmt;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::event_loop::Handle;
use crate::promise::{Promise, Settler};

struct MutexInner {
    handle: Handle,
    locked: Cell<bool>,
    waiters: RefCell<VecDeque<Settler<MutexGuard>>>,
}

/// A fair FIFO async mutex.
#[derive(Clone)]
pub struct Mutex {
    inner: Rc<MutexInner>,
}

/// Holds the lock; released when the last clone drops.
#[derive(Clone)]
pub struct MutexGuard {
    inner: Rc<GuardInner>,
}

struct GuardInner {
    mutex: Rc<MutexInner>,
}

// === impl Mutex ===

impl Mutex {
    pub fn new(handle: &Handle) -> Self {
        Self {
            inner: Rc::new(MutexInner {
                handle: handle.clone(),
                locked: Cell::new(false),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Acquires the lock: fulfils immediately if unlocked, otherwise joins
    /// the FIFO waiter queue.
    pub fn lock(&self) -> Promise<MutexGuard> {
        if !self.inner.locked.replace(true) {
            tracing::trace!("mutex acquired immediately");
            return self.inner.handle.resolved(self.guard());
        }
        let (promise, settler) = self.inner.handle.promise::<MutexGuard>();
        self.inner.waiters.borrow_mut().push_back(settler);
        promise
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard> {
        if self.inner.locked.replace(true) {
            return None;
        }
        Some(self.guard())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.get()
    }

    fn guard(&self) -> MutexGuard {
        MutexGuard {
            inner: Rc::new(GuardInner {
                mutex: Rc::clone(&self.inner),
            }),
        }
    }
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        // hand the lock to the oldest waiter still being awaited
        loop {
            let next = self.mutex.waiters.borrow_mut().pop_front();
            match next {
                Some(settler) if settler.is_abandoned() => {}
                Some(settler) => {
                    tracing::trace!("mutex handed to next waiter");
                    settler.fulfil(MutexGuard {
                        inner: Rc::new(GuardInner {
                            mutex: Rc::clone(&self.mutex),
                        }),
                    });
                    return;
                }
                None => break,
            }
        }
        self.mutex.locked.set(false);
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.inner.locked.get())
            .field("waiters", &self.inner.waiters.borrow().len())
            .finish()
    }
}

impl fmt::Debug for MutexGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("MutexGuard")
    }
}
