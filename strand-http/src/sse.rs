// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Server-Sent Events: wire parsing and the reconnection policy.
//!
//! The parser is incremental — events may arrive split across arbitrary
//! chunk boundaries. An event terminates at a blank line; recognized fields
//! are `event`, `data` (multi-line, joined with `\n`), `id`, and `retry`
//! (milliseconds, overriding the next computed reconnect backoff).

use core::cell::{Cell, RefCell};
use core::fmt;
use core::time::Duration;
use std::rc::Rc;

use strand::Error;

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<Duration>,
}

/// Incremental SSE wire parser.
#[derive(Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    event_type: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<Duration>,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk; returns every event completed by it.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // comment / keep-alive
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event_type = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                "retry" => {
                    if let Ok(millis) = value.parse::<u64>() {
                        self.retry = Some(Duration::from_millis(millis));
                    }
                }
                _ => {} // unknown fields are ignored per the wire format
            }
        }
        events
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event_type.is_none() && self.id.is_none() {
            return None;
        }
        Some(SseEvent {
            event: self.event_type.take(),
            data: core::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
            retry: self.retry.take(),
        })
    }
}

/// Reconnection policy for an SSE stream.
#[derive(Clone)]
pub struct SseReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Substrings matched against the failure; empty means any failure is
    /// eligible.
    pub retryable_errors: Vec<String>,
    /// Observer hook: `(attempt, delay, error)` before each reconnect wait.
    pub on_reconnect: Option<Rc<dyn Fn(u32, Duration, &Error)>>,
    /// Overrides the retryable-error list entirely when present.
    pub should_reconnect: Option<Rc<dyn Fn(&Error) -> bool>>,
}

impl Default for SseReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_errors: Vec::new(),
            on_reconnect: None,
            should_reconnect: None,
        }
    }
}

impl SseReconnectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Backoff for the given 1-based attempt, before any `retry:` override.
    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scaled =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            capped * (0.75 + fastrand::f64() * 0.5)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub(crate) fn wants_reconnect(&self, error: &Error) -> bool {
        if let Some(predicate) = &self.should_reconnect {
            return predicate(error);
        }
        if self.retryable_errors.is_empty() {
            return true;
        }
        let message = error.to_string().to_ascii_lowercase();
        self.retryable_errors
            .iter()
            .any(|needle| message.contains(&needle.to_ascii_lowercase()))
    }
}

impl fmt::Debug for SseReconnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseReconnectConfig")
            .field("enabled", &self.enabled)
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

pub(crate) struct SseHandleInner {
    pub(crate) closed: Cell<bool>,
    pub(crate) abort: RefCell<Option<Box<dyn Fn()>>>,
    pub(crate) last_event_id: RefCell<Option<String>>,
    pub(crate) status: Cell<u16>,
    pub(crate) attempts: Cell<u32>,
}

/// Live control surface for an SSE stream, resolved once response headers
/// arrive. Events keep flowing through the `on_event` callback; `close`
/// aborts the transfer and disables reconnection.
#[derive(Clone)]
pub struct SseHandle {
    pub(crate) inner: Rc<SseHandleInner>,
}

impl SseHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(SseHandleInner {
                closed: Cell::new(false),
                abort: RefCell::new(None),
                last_event_id: RefCell::new(None),
                status: Cell::new(0),
                attempts: Cell::new(0),
            }),
        }
    }

    /// Aborts the stream; idempotent.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        tracing::debug!("sse stream closed by caller");
        if let Some(abort) = self.inner.abort.borrow_mut().take() {
            abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// The last `id:` seen; sent as `Last-Event-ID` on reconnects.
    pub fn last_event_id(&self) -> Option<String> {
        self.inner.last_event_id.borrow().clone()
    }

    /// HTTP status of the current connection.
    pub fn status(&self) -> u16 {
        self.inner.status.get()
    }

    /// Reconnect attempts made so far (resets on success).
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.get()
    }
}

impl fmt::Debug for SseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseHandle")
            .field("closed", &self.inner.closed.get())
            .field("last_event_id", &self.inner.last_event_id.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks_reassemble() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: tick\nda").is_empty());
        let events = parser.feed(b"ta: one\nid: 3\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("tick".into()),
                data: "one".into(),
                id: Some("3".into()),
                retry: None,
            }]
        );
    }

    #[test]
    fn multiline_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: first\ndata: second\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn comments_and_unknown_fields_are_ignored() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keep-alive\nfoo: bar\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn retry_field_parses_milliseconds() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"retry: 1500\ndata: x\n\n");
        assert_eq!(events[0].retry, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn blank_line_without_fields_produces_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"\n\n\n").is_empty());
    }

    #[test]
    fn reconnect_backoff_multiplies_and_caps() {
        let config = SseReconnectConfig {
            jitter: false,
            max_delay: Duration::from_secs(4),
            ..SseReconnectConfig::default()
        };
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(2));
        assert_eq!(config.delay_for(3), Duration::from_secs(4));
        assert_eq!(config.delay_for(9), Duration::from_secs(4));
    }

    #[test]
    fn predicate_overrides_retryable_list() {
        let mut config = SseReconnectConfig {
            retryable_errors: vec!["reset".into()],
            ..SseReconnectConfig::default()
        };
        assert!(config.wants_reconnect(&Error::Stream("connection reset".into())));
        assert!(!config.wants_reconnect(&Error::Stream("forbidden".into())));

        config.should_reconnect = Some(Rc::new(|_| true));
        assert!(config.wants_reconnect(&Error::Stream("forbidden".into())));
    }
}
