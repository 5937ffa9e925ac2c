// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness registration for sockets and streams.
//!
//! One-shot watchers over an edge-triggered [`mio::Poll`]: a callback fires
//! at most once per readiness edge and is responsible for re-registering if
//! it wants more I/O. At most one read and one write watcher exist per
//! source; re-registration replaces. The loop's blocking sleep is
//! [`Reactor::poll`] with the tick's computed budget, and a [`mio::Waker`]
//! lets worker threads interrupt it.

use core::time::Duration;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

use crate::event_loop::Handle;

const WAKER_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 256;

pub(crate) type IoCallback = Box<dyn FnOnce(&Handle)>;

#[derive(Default)]
struct SourceWatchers {
    read: Option<IoCallback>,
    write: Option<IoCallback>,
}

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    waker: Arc<mio::Waker>,
    watchers: HashMap<Token, SourceWatchers>,
    next_token: usize,
}

// === impl Reactor ===

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker,
            watchers: HashMap::new(),
            next_token: 1,
        })
    }

    /// Handle used to interrupt a sleeping poll from another thread.
    pub(crate) fn unpark_handle(&self) -> Arc<mio::Waker> {
        Arc::clone(&self.waker)
    }

    /// Registers a source for both readiness directions and allocates its
    /// token. Sources stay registered until [`Reactor::deregister`].
    pub(crate) fn register(&mut self, source: &mut impl Source) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(source, token, Interest::READABLE | Interest::WRITABLE)?;
        self.watchers.insert(token, SourceWatchers::default());
        tracing::trace!(token = token.0, "source registered");
        Ok(token)
    }

    pub(crate) fn deregister(&mut self, source: &mut impl Source, token: Token) {
        self.watchers.remove(&token);
        if let Err(err) = self.poll.registry().deregister(source) {
            tracing::debug!(token = token.0, %err, "deregister failed");
        }
    }

    /// Arms the read watcher; replaces any previous one.
    pub(crate) fn set_read(&mut self, token: Token, callback: IoCallback) {
        if let Some(watchers) = self.watchers.get_mut(&token) {
            watchers.read = Some(callback);
        }
    }

    /// Arms the write watcher; replaces any previous one.
    pub(crate) fn set_write(&mut self, token: Token, callback: IoCallback) {
        if let Some(watchers) = self.watchers.get_mut(&token) {
            watchers.write = Some(callback);
        }
    }

    /// Drops both watchers without deregistering the source.
    pub(crate) fn clear(&mut self, token: Token) {
        if let Some(watchers) = self.watchers.get_mut(&token) {
            watchers.read = None;
            watchers.write = None;
        }
    }

    pub(crate) fn clear_read(&mut self, token: Token) {
        if let Some(watchers) = self.watchers.get_mut(&token) {
            watchers.read = None;
        }
    }

    pub(crate) fn clear_write(&mut self, token: Token) {
        if let Some(watchers) = self.watchers.get_mut(&token) {
            watchers.write = None;
        }
    }

    /// Number of armed watcher callbacks; keeps the loop alive.
    pub(crate) fn armed_len(&self) -> usize {
        self.watchers
            .values()
            .map(|w| usize::from(w.read.is_some()) + usize::from(w.write.is_some()))
            .sum()
    }

    /// Blocks for at most `timeout`, then takes the callbacks whose edges
    /// fired. Error/hang-up conditions wake both directions so the owning
    /// operation observes the failure through its own syscall.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<IoCallback>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }

        let mut fired = Vec::new();
        for event in &self.events {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let Some(watchers) = self.watchers.get_mut(&token) else {
                continue;
            };

            let broken = event.is_error() || event.is_read_closed() || event.is_write_closed();
            if (event.is_readable() || broken)
                && let Some(callback) = watchers.read.take()
            {
                fired.push(callback);
            }
            if (event.is_writable() || broken)
                && let Some(callback) = watchers.write.take()
            {
                fired.push(callback);
            }
        }
        if !fired.is_empty() {
            tracing::trace!(fired = fired.len(), "io watchers fired");
        }
        Ok(fired)
    }
}

// === impl Handle (watcher facade) ===

impl Handle {
    /// Registers `source` with the readiness poller; the returned token keys
    /// all watcher operations for it.
    pub fn register_io(&self, source: &mut impl Source) -> io::Result<Token> {
        self.shared().reactor.borrow_mut().register(source)
    }

    /// Deregisters `source` and drops its watchers.
    pub fn deregister_io(&self, source: &mut impl Source, token: Token) {
        self.shared().reactor.borrow_mut().deregister(source, token);
    }

    /// Arms the one-shot read watcher for `token`; replaces any previous one.
    pub fn add_read_watcher(&self, token: Token, callback: impl FnOnce(&Handle) + 'static) {
        self.shared()
            .reactor
            .borrow_mut()
            .set_read(token, Box::new(callback));
    }

    /// Arms the one-shot write watcher for `token`; replaces any previous one.
    pub fn add_write_watcher(&self, token: Token, callback: impl FnOnce(&Handle) + 'static) {
        self.shared()
            .reactor
            .borrow_mut()
            .set_write(token, Box::new(callback));
    }

    /// Drops both watchers for `token` without firing them.
    pub fn clear_watchers(&self, token: Token) {
        self.shared().reactor.borrow_mut().clear(token);
    }

    /// Drops only the read watcher for `token`.
    pub fn clear_read_watcher(&self, token: Token) {
        self.shared().reactor.borrow_mut().clear_read(token);
    }

    /// Drops only the write watcher for `token`.
    pub fn clear_write_watcher(&self, token: Token) {
        self.shared().reactor.borrow_mut().clear_write(token);
    }
}
