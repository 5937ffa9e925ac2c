// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-blocking TCP sockets over the readiness layer.
//!
//! Every operation is promise-shaped: attempt the syscall, and on
//! `WouldBlock` arm a one-shot watcher that retries when the edge fires.
//! Connect races a timeout timer against write readiness; reads resolve
//! `None` on orderly close; writes re-register until the buffer drains.
//! `close` is idempotent and terminal — anything after it rejects
//! [`Error::SocketClosed`].

use core::cell::{Cell, RefCell};
use core::fmt;
use core::net::SocketAddr;
use core::time::Duration;
use std::io::{Read, Write};
use std::rc::Rc;

use mio::Token;

use crate::combinator;
use crate::error::{Error, Result};
use crate::event_loop::Handle;
use crate::promise::{Promise, Settler};

/// Socket-level options recognized by [`connect`].
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Connect timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Verify the peer address is known once the connect completes.
    pub verify_peer: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            verify_peer: true,
        }
    }
}

/// Stream-level options. `context` and `use_include_path` are opaque
/// platform hints carried for callers that need them; only `buffer_size`
/// (and `mode` for file-backed streams) influence behaviour here.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub mode: Option<String>,
    pub buffer_size: usize,
    pub context: Option<String>,
    pub use_include_path: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            mode: None,
            buffer_size: 8 * 1024,
            context: None,
            use_include_path: false,
        }
    }
}

struct StreamShared {
    handle: Handle,
    io: RefCell<Option<mio::net::TcpStream>>,
    token: Token,
    options: StreamOptions,
    closed: Cell<bool>,
}

/// A connected, loop-registered TCP stream. Clones share the socket.
#[derive(Clone)]
pub struct TcpStream {
    inner: Rc<StreamShared>,
}

/// Opens a non-blocking connection to `addr`.
///
/// A write watcher signals completion; a timer enforces
/// `options.timeout`. On failure the socket is closed, watchers cleared,
/// the timer cancelled, and the promise rejects [`Error::Connection`].
pub fn connect(handle: &Handle, addr: SocketAddr, options: SocketOptions) -> Promise<TcpStream> {
    let mut sock = match mio::net::TcpStream::connect(addr) {
        Ok(sock) => sock,
        Err(err) => return handle.rejected(Error::connection(err)),
    };
    let token = match handle.register_io(&mut sock) {
        Ok(token) => token,
        Err(err) => return handle.rejected(Error::connection(err)),
    };

    let stream = TcpStream {
        inner: Rc::new(StreamShared {
            handle: handle.clone(),
            io: RefCell::new(Some(sock)),
            token,
            options: StreamOptions::default(),
            closed: Cell::new(false),
        }),
    };
    tracing::debug!(%addr, token = token.0, "connecting");

    let (promise, settler, cancel) = handle.cancellable::<TcpStream>();

    let timer = options.timeout.map(|window| {
        let stream = stream.clone();
        let settler = settler.clone();
        handle.add_timer(window, move |_handle| {
            stream.close();
            settler.reject(Error::Connection(format!(
                "connect to {addr} timed out after {window:?}"
            )));
        })
    });

    {
        let stream = stream.clone();
        cancel.on_cancel(move |handle| {
            if let Some(timer) = timer {
                handle.cancel_timer(timer);
            }
            stream.close();
        });
    }

    let verify_peer = options.verify_peer;
    handle.add_write_watcher(token, move |handle| {
        if let Some(timer) = timer {
            handle.cancel_timer(timer);
        }
        match stream.finish_connect(verify_peer) {
            Ok(()) => {
                tracing::debug!(%addr, "connected");
                settler.fulfil(stream.clone());
            }
            Err(err) => {
                stream.close();
                settler.reject(err);
            }
        }
    });

    promise
}

// === impl TcpStream ===

impl TcpStream {
    /// Reads at most `max_len` bytes once the socket is readable.
    ///
    /// Fulfils `None` on orderly close. With a timeout, rejects
    /// [`Error::Timeout`] if no data arrives in the window (and the armed
    /// watcher is detached).
    pub fn read(&self, max_len: usize, timeout: Option<Duration>) -> Promise<Option<Vec<u8>>> {
        let handle = self.inner.handle.clone();
        if self.inner.closed.get() {
            return handle.rejected(Error::SocketClosed);
        }
        let max_len = if max_len == 0 {
            self.inner.options.buffer_size
        } else {
            max_len
        };

        let (promise, settler, cancel) = handle.cancellable::<Option<Vec<u8>>>();
        {
            let stream = self.clone();
            cancel.on_cancel(move |handle| handle.clear_read_watcher(stream.inner.token));
        }
        poll_read(
            &handle,
            ReadOp {
                stream: self.clone(),
                settler,
                max_len,
            },
        );

        match timeout {
            Some(window) => combinator::timeout(&handle, promise, window),
            None => promise,
        }
    }

    /// Writes the whole buffer, re-registering on partial writes until every
    /// byte is accepted or the socket errors.
    pub fn write_all(&self, data: Vec<u8>) -> Promise<()> {
        let handle = self.inner.handle.clone();
        if self.inner.closed.get() {
            return handle.rejected(Error::SocketClosed);
        }

        let (promise, settler, cancel) = handle.cancellable::<()>();
        {
            let stream = self.clone();
            cancel.on_cancel(move |handle| handle.clear_write_watcher(stream.inner.token));
        }
        poll_write(
            &handle,
            WriteOp {
                stream: self.clone(),
                settler,
                data,
                written: 0,
            },
        );
        promise
    }

    /// Closes the socket: clears watchers, deregisters, drops the handle.
    /// Idempotent; subsequent operations reject [`Error::SocketClosed`].
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        tracing::debug!(token = self.inner.token.0, "socket closed");
        if let Some(mut sock) = self.inner.io.borrow_mut().take() {
            self.inner.handle.deregister_io(&mut sock, self.inner.token);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// The peer address, while the socket is open.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let io = self.inner.io.borrow();
        let sock = io.as_ref().ok_or(Error::SocketClosed)?;
        sock.peer_addr().map_err(Error::socket)
    }

    fn finish_connect(&self, verify_peer: bool) -> Result<()> {
        let io = self.inner.io.borrow();
        let sock = io.as_ref().ok_or(Error::SocketClosed)?;
        if let Some(err) = sock.take_error().map_err(Error::connection)? {
            return Err(Error::connection(err));
        }
        if verify_peer {
            sock.peer_addr().map_err(Error::connection)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream")
            .field("token", &self.inner.token.0)
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

struct ReadOp {
    stream: TcpStream,
    settler: Settler<Option<Vec<u8>>>,
    max_len: usize,
}

/// One read attempt; arms the read watcher on `WouldBlock`.
fn poll_read(handle: &Handle, op: ReadOp) {
    let shared = Rc::clone(&op.stream.inner);
    let mut io = shared.io.borrow_mut();
    let Some(sock) = io.as_mut() else {
        op.settler.reject(Error::SocketClosed);
        return;
    };

    let mut buf = vec![0_u8; op.max_len];
    match sock.read(&mut buf) {
        Ok(0) => op.settler.fulfil(None),
        Ok(n) => {
            buf.truncate(n);
            op.settler.fulfil(Some(buf));
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            drop(io);
            let token = shared.token;
            handle.add_read_watcher(token, move |handle| poll_read(handle, op));
        }
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
            drop(io);
            poll_read(handle, op);
        }
        Err(err) => op.settler.reject(Error::socket(err)),
    }
}

struct WriteOp {
    stream: TcpStream,
    settler: Settler<()>,
    data: Vec<u8>,
    written: usize,
}

/// Writes as much as the socket accepts; re-arms the write watcher while
/// bytes remain.
fn poll_write(handle: &Handle, mut op: WriteOp) {
    let shared = Rc::clone(&op.stream.inner);
    let mut io = shared.io.borrow_mut();
    let Some(sock) = io.as_mut() else {
        op.settler.reject(Error::SocketClosed);
        return;
    };

    while op.written < op.data.len() {
        match sock.write(&op.data[op.written..]) {
            Ok(0) => {
                op.settler
                    .reject(Error::Socket("write returned zero bytes".into()));
                return;
            }
            Ok(n) => op.written += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                drop(io);
                let token = shared.token;
                handle.add_write_watcher(token, move |handle| poll_write(handle, op));
                return;
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                op.settler.reject(Error::socket(err));
                return;
            }
        }
    }
    op.settler.fulfil(());
}
