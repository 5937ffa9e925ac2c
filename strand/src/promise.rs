// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-assignment settlement cells with chainable continuations.
//!
//! A [`Promise`] settles exactly once, to a value or to an [`Error`]. All
//! continuations — whether registered before or after settlement — run as
//! micro-tasks on the owning event loop, never synchronously, and in FIFO
//! registration order.

use core::cell::{Cell, RefCell};
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::event_loop::Handle;
use crate::time::TimerId;

/// Runs a chain handler, converting a panic into a rejection reason.
pub(crate) fn catch_handler_panic<T>(f: impl FnOnce() -> T) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(Error::from_panic)
}

type Continuation<T> = Box<dyn FnOnce(&Handle, Result<T>)>;

enum State<T> {
    Pending {
        continuations: Vec<Continuation<T>>,
        wakers: Vec<Waker>,
    },
    Settled(Result<T>),
}

struct Inner<T> {
    handle: Handle,
    state: RefCell<State<T>>,
    root: RefCell<Option<CancelHandle>>,
}

/// A single-assignment settlement cell bound to an event loop.
///
/// `T: Clone` because settlement is multi-consumer: every continuation and
/// every `.await` observes its own copy of the outcome.
pub struct Promise<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// The resolving half of a [`Promise`].
///
/// The first call to [`fulfil`][Settler::fulfil] or [`reject`][Settler::reject]
/// wins; every later call is a no-op. Holds only a weak reference, so a
/// promise abandoned by all consumers is freed even while its settler lives
/// inside a timer or watcher callback.
pub struct Settler<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for Settler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

// === impl Handle (promise constructors) ===

impl Handle {
    /// Creates a pending promise together with its settler.
    pub fn promise<T: Clone + 'static>(&self) -> (Promise<T>, Settler<T>) {
        let inner = Rc::new(Inner {
            handle: self.clone(),
            state: RefCell::new(State::Pending {
                continuations: Vec::new(),
                wakers: Vec::new(),
            }),
            root: RefCell::new(None),
        });
        let settler = Settler {
            inner: Rc::downgrade(&inner),
        };
        (Promise { inner }, settler)
    }

    /// An already-fulfilled promise.
    pub fn resolved<T: Clone + 'static>(&self, value: T) -> Promise<T> {
        let (promise, settler) = self.promise();
        settler.fulfil(value);
        promise
    }

    /// An already-rejected promise.
    pub fn rejected<T: Clone + 'static>(&self, error: Error) -> Promise<T> {
        let (promise, settler) = self.promise();
        settler.reject(error);
        promise
    }

    /// Creates a pending promise that can be cancelled from the outside.
    ///
    /// Cancelling runs the (optional) cancel handler once, cancels the owned
    /// timer if any, then rejects the promise with [`Error::Cancelled`] if it
    /// is still pending. Promises derived from this one via `map`/`then`/
    /// `or_else`/`finally` inherit the handle, so cancelling anywhere in the
    /// chain reaches this root.
    pub fn cancellable<T: Clone + 'static>(&self) -> (Promise<T>, Settler<T>, CancelHandle) {
        let (promise, settler) = self.promise::<T>();
        let cancel = CancelHandle::new(self.clone());
        let rejecter = settler.clone();
        cancel
            .cell
            .rejecter
            .replace(Some(Box::new(move |_h: &Handle| {
                rejecter.reject(Error::Cancelled);
            })));
        promise.set_root(cancel.clone());
        (promise, settler, cancel)
    }
}

// === impl Promise ===

impl<T: Clone + 'static> Promise<T> {
    /// The event loop this promise is bound to.
    pub fn handle(&self) -> Handle {
        self.inner.handle.clone()
    }

    /// True once the promise is fulfilled or rejected.
    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.state.borrow(), State::Settled(_))
    }

    /// A copy of the outcome, if settled.
    pub fn peek(&self) -> Option<Result<T>> {
        match &*self.inner.state.borrow() {
            State::Settled(result) => Some(result.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Registers a continuation for the settlement.
    ///
    /// Runs as a micro-task: if the promise is already settled the callback
    /// is scheduled on the next-tick queue, otherwise it is queued in FIFO
    /// order behind every continuation registered before it.
    pub fn subscribe(&self, f: impl FnOnce(&Handle, Result<T>) + 'static) {
        let mut state = self.inner.state.borrow_mut();
        match &mut *state {
            State::Pending { continuations, .. } => continuations.push(Box::new(f)),
            State::Settled(result) => {
                let result = result.clone();
                drop(state);
                self.inner
                    .handle
                    .next_tick(move |handle| f(handle, result));
            }
        }
    }

    /// Maps the fulfilment value through `f`; a panic in `f` rejects the
    /// derived promise with [`Error::Panicked`].
    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let (derived, settler) = self.inner.handle.promise::<U>();
        derived.adopt_root_of(self);
        self.subscribe(move |_handle, result| match result {
            Ok(value) => match catch_handler_panic(move || f(value)) {
                Ok(mapped) => settler.fulfil(mapped),
                Err(panic) => settler.reject(panic),
            },
            Err(err) => settler.reject(err),
        });
        derived
    }

    /// Chains a promise-returning continuation; the derived promise mirrors
    /// the settlement of the promise returned by `f` (assimilation).
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(&Handle, T) -> Promise<U> + 'static,
    {
        let (derived, settler) = self.inner.handle.promise::<U>();
        derived.adopt_root_of(self);
        self.subscribe(move |handle, result| match result {
            Ok(value) => match catch_handler_panic(move || f(handle, value)) {
                Ok(next) => next.forward_to(settler),
                Err(panic) => settler.reject(panic),
            },
            Err(err) => settler.reject(err),
        });
        derived
    }

    /// Recovers from a rejection with a promise-returning handler; a
    /// fulfilment passes through untouched.
    pub fn or_else<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(&Handle, Error) -> Promise<T> + 'static,
    {
        let (derived, settler) = self.inner.handle.promise::<T>();
        derived.adopt_root_of(self);
        self.subscribe(move |handle, result| match result {
            Ok(value) => settler.fulfil(value),
            Err(err) => match catch_handler_panic(move || f(handle, err)) {
                Ok(next) => next.forward_to(settler),
                Err(panic) => settler.reject(panic),
            },
        });
        derived
    }

    /// Maps a rejection reason, leaving fulfilments untouched.
    pub fn map_err<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(Error) -> Error + 'static,
    {
        let (derived, settler) = self.inner.handle.promise::<T>();
        derived.adopt_root_of(self);
        self.subscribe(move |_handle, result| match result {
            Ok(value) => settler.fulfil(value),
            Err(err) => match catch_handler_panic(move || f(err)) {
                Ok(mapped) => settler.reject(mapped),
                Err(panic) => settler.reject(panic),
            },
        });
        derived
    }

    /// Runs `f` on either terminal branch. The callback observes no value
    /// and cannot change the outcome; a panic inside it rejects the chain.
    pub fn finally<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce() + 'static,
    {
        let (derived, settler) = self.inner.handle.promise::<T>();
        derived.adopt_root_of(self);
        self.subscribe(move |_handle, result| match catch_handler_panic(f) {
            Ok(()) => match result {
                Ok(value) => settler.fulfil(value),
                Err(err) => settler.reject(err),
            },
            Err(panic) => settler.reject(panic),
        });
        derived
    }

    /// Cancels the chain's root cancellable, if there is one.
    ///
    /// Idempotent; a promise with no cancellable origin is unaffected.
    /// Returns whether a root was reached.
    pub fn cancel(&self) -> bool {
        let root = self.inner.root.borrow().clone();
        match root {
            Some(root) => {
                root.cancel();
                true
            }
            None => false,
        }
    }

    /// The chain's root cancellable, if any.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.inner.root.borrow().clone()
    }

    /// Settles `settler` with whatever this promise settles with.
    pub(crate) fn forward_to(&self, settler: Settler<T>) {
        self.subscribe(move |_handle, result| settler.settle(result));
    }

    pub(crate) fn set_root(&self, root: CancelHandle) {
        self.inner.root.replace(Some(root));
    }

    /// Identity comparison: two handles to the same settlement cell.
    pub(crate) fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn adopt_root_of<U>(&self, source: &Promise<U>) {
        let root = source.inner.root.borrow().clone();
        if root.is_some() {
            self.inner.root.replace(root);
        }
    }
}

impl<T: Clone + 'static> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.borrow_mut();
        match &mut *state {
            State::Settled(result) => Poll::Ready(result.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.borrow() {
            State::Pending { continuations, .. } => format!("pending({})", continuations.len()),
            State::Settled(Ok(_)) => "fulfilled".to_string(),
            State::Settled(Err(err)) => format!("rejected({err})"),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

// === impl Settler ===

impl<T: Clone + 'static> Settler<T> {
    /// Fulfils the promise; a no-op after the first settlement.
    pub fn fulfil(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Rejects the promise; a no-op after the first settlement.
    pub fn reject(&self, error: Error) {
        self.settle(Err(error));
    }

    /// True if every consumer dropped the promise.
    pub fn is_abandoned(&self) -> bool {
        self.inner.strong_count() == 0
    }

    pub(crate) fn settle(&self, result: Result<T>) {
        let Some(inner) = self.inner.upgrade() else {
            // every consumer is gone, the outcome is unobservable
            return;
        };

        let mut state = inner.state.borrow_mut();
        let State::Pending {
            continuations,
            wakers,
        } = &mut *state
        else {
            tracing::trace!("settle on an already-settled promise ignored");
            return;
        };

        let continuations = core::mem::take(continuations);
        let wakers = core::mem::take(wakers);
        *state = State::Settled(result.clone());
        drop(state);

        // Continuations fire in registration order, one micro-task each.
        for continuation in continuations {
            let result = result.clone();
            inner
                .handle
                .next_tick(move |handle| continuation(handle, result));
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

// === impl CancelHandle ===

pub(crate) struct CancelCell {
    handle: Handle,
    cancelled: Cell<bool>,
    on_cancel: RefCell<Option<Box<dyn FnOnce(&Handle)>>>,
    owned_timer: Cell<Option<TimerId>>,
    rejecter: RefCell<Option<Box<dyn FnOnce(&Handle)>>>,
}

/// Shared cancellation cell for a cancellable promise chain.
#[derive(Clone)]
pub struct CancelHandle {
    cell: Rc<CancelCell>,
}

impl CancelHandle {
    fn new(handle: Handle) -> Self {
        Self {
            cell: Rc::new(CancelCell {
                handle,
                cancelled: Cell::new(false),
                on_cancel: RefCell::new(None),
                owned_timer: Cell::new(None),
                rejecter: RefCell::new(None),
            }),
        }
    }

    /// Installs the cancel handler; replaces any previous one.
    pub fn on_cancel(&self, f: impl FnOnce(&Handle) + 'static) {
        self.cell.on_cancel.replace(Some(Box::new(f)));
    }

    /// Marks `timer` as owned: it is cancelled alongside the promise.
    pub fn own_timer(&self, timer: TimerId) {
        self.cell.owned_timer.set(Some(timer));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.cancelled.get()
    }

    /// Cancels the root: runs the handler exactly once, cancels the owned
    /// timer, then rejects the promise with [`Error::Cancelled`] if still
    /// pending. Idempotent. Handler panics are captured and logged, never
    /// propagated into the loop.
    pub fn cancel(&self) {
        if self.cell.cancelled.replace(true) {
            return;
        }
        tracing::trace!("cancelling promise root");

        let handle = self.cell.handle.clone();
        if let Some(on_cancel) = self.cell.on_cancel.borrow_mut().take()
            && let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_cancel(&handle)))
        {
            tracing::error!(err = %Error::from_panic(payload), "cancel handler panicked");
        }
        if let Some(timer) = self.cell.owned_timer.take() {
            handle.cancel_timer(timer);
        }
        if let Some(rejecter) = self.cell.rejecter.borrow_mut().take() {
            rejecter(&handle);
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.cell.cancelled.get())
            .finish()
    }
}
