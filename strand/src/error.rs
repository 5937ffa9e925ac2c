// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::time::Duration;

/// The error taxonomy surfaced at every boundary of the runtime.
///
/// Promise rejections and task errors are the same channel, so this type is
/// `Clone`: a settled rejection may be observed by any number of consumers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The operation's promise was cancelled before it settled.
    #[error("operation was cancelled")]
    Cancelled,

    /// The operation did not settle within the allowed window.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Establishing a connection failed (refused, unreachable, connect timeout).
    #[error("connection failed: {0}")]
    Connection(String),

    /// The socket was closed; all further operations on it fail with this.
    #[error("socket is closed")]
    SocketClosed,

    /// A read/write on an open socket failed.
    #[error("socket error: {0}")]
    Socket(String),

    /// An HTTP transfer failed, or completed with an error status.
    #[error("http error{}: {message}", fmt_status(.status))]
    Http {
        status: Option<u16>,
        message: String,
    },

    /// A streaming transfer broke mid-flight.
    #[error("stream error: {0}")]
    Stream(String),

    /// The pool was closed while the acquisition was pending, or before it.
    #[error("pool is closed")]
    PoolClosed,

    /// A runtime facility was used outside a running event loop.
    #[error("not inside a running event loop")]
    NotInTask,

    /// A file operation failed.
    #[error("file operation failed: {0}")]
    File(String),

    /// A configuration record was rejected at validation time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A task body or callback panicked; the payload message is preserved.
    #[error("panicked: {0}")]
    Panicked(String),

    /// Every input of `any` rejected; reasons preserve input order.
    #[error("all {} inputs rejected", .0.len())]
    Aggregate(Vec<Error>),
}

pub type Result<T> = core::result::Result<T, Error>;

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {code})"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn file(err: std::io::Error) -> Self {
        Error::File(err.to_string())
    }

    pub(crate) fn socket(err: std::io::Error) -> Self {
        Error::Socket(err.to_string())
    }

    pub(crate) fn connection(err: impl core::fmt::Display) -> Self {
        Error::Connection(err.to_string())
    }

    /// Extracts a printable message from a panic payload.
    pub(crate) fn from_panic(payload: Box<dyn core::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Error::Panicked(message)
    }

    /// True for the distinguished cancellation rejection.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_display_with_and_without_status() {
        let with = Error::Http {
            status: Some(503),
            message: "service unavailable".into(),
        };
        assert_eq!(with.to_string(), "http error (status 503): service unavailable");

        let without = Error::Http {
            status: None,
            message: "dns failure".into(),
        };
        assert_eq!(without.to_string(), "http error: dns failure");
    }

    #[test]
    fn panic_payload_messages_are_preserved() {
        let payload: Box<dyn core::any::Any + Send> = Box::new("boom");
        assert_eq!(Error::from_panic(payload), Error::Panicked("boom".into()));

        let payload: Box<dyn core::any::Any + Send> = Box::new(42_u32);
        assert_eq!(
            Error::from_panic(payload),
            Error::Panicked("task panicked".into())
        );
    }
}
