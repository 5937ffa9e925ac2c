// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The multiplexed HTTP request manager.
//!
//! One [`HttpManager`] per loop wraps a `curl::multi::Multi` and registers
//! itself as a loop [`Driver`]: every tick advances all in-flight transfers,
//! dispatches arrived chunks/headers, and completes finished ones. Transfer
//! completions, chunk deliveries, and header notifications are re-scheduled
//! as micro-tasks so user callbacks never run while the manager is borrowed
//! — a retry or a follow-up `fetch` from inside a callback is safe.
//!
//! `fetch` runs the single cache+retry pipeline: cache lookup (GET),
//! conditional revalidation, dispatch with exponential-backoff retries,
//! store-back.

use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use curl::easy::{Easy2, Handler, HttpVersion, List, WriteError};
use curl::multi::{Easy2Handle, Multi};

use strand::{Driver, Error, Handle, Promise, Result, Settler, TimerId};

use crate::cache::{CacheBackend, CachedResponse, MemoryCache, cache_key, expires_at, is_cacheable, unix_now};
use crate::options::{Auth, HttpVersionPref, Method, RequestOptions};
use crate::response::{Response, StreamingResponse, parse_header_lines};
use crate::sse::{SseEvent, SseHandle, SseParser, SseReconnectConfig};

/// Poll cadence for in-flight transfers when libcurl reports no sooner
/// deadline of its own.
const TRANSFER_POLL: Duration = Duration::from_millis(50);

type ChunkCallback = Rc<RefCell<dyn FnMut(&Handle, Vec<u8>)>>;
type HeaderCallback = Box<dyn FnOnce(&Handle, u16, HashMap<String, String>, String)>;
type CompleteCallback = Box<dyn FnOnce(&Handle, Result<Response>)>;

/// Accumulates a transfer's data. All curl callbacks run on the loop thread
/// inside `Multi::perform`; the collector only buffers — dispatch to user
/// callbacks happens afterwards, from the manager's turn.
struct Collector {
    body: Vec<u8>,
    buffer_body: bool,
    pending_chunks: Vec<Vec<u8>>,
    collect_chunks: bool,
    header_lines: Vec<String>,
    headers_complete: bool,
    sink: Option<File>,
    sink_path: Option<PathBuf>,
    sink_error: Option<String>,
}

impl Collector {
    fn new(buffer_body: bool, collect_chunks: bool, sink: Option<(File, PathBuf)>) -> Self {
        let (sink, sink_path) = match sink {
            Some((file, path)) => (Some(file), Some(path)),
            None => (None, None),
        };
        Self {
            body: Vec::new(),
            buffer_body,
            pending_chunks: Vec::new(),
            collect_chunks,
            header_lines: Vec::new(),
            headers_complete: false,
            sink,
            sink_path,
            sink_error: None,
        }
    }
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> core::result::Result<usize, WriteError> {
        if let Some(sink) = &mut self.sink
            && let Err(err) = sink.write_all(data)
        {
            self.sink_error = Some(err.to_string());
            return Ok(0); // aborts the transfer
        }
        if self.collect_chunks {
            self.pending_chunks.push(data.to_vec());
        }
        if self.buffer_body {
            self.body.extend_from_slice(data);
        }
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        let line = String::from_utf8_lossy(data).into_owned();
        if line == "\r\n" || line == "\n" {
            self.headers_complete = true;
        } else if line.starts_with("HTTP/") {
            // a redirect hop starts a fresh block
            self.headers_complete = false;
        }
        self.header_lines.push(line);
        true
    }
}

struct InFlight {
    transfer: Easy2Handle<Collector>,
    on_done: Option<Box<dyn FnOnce(&Handle, TransferOutcome)>>,
    on_chunk: Option<ChunkCallback>,
    on_headers: Option<HeaderCallback>,
    headers_dispatched: bool,
}

struct TransferOutcome {
    result: core::result::Result<(), String>,
    status: u16,
    headers: HashMap<String, String>,
    version: String,
    body: Vec<u8>,
}

struct Multiplexer {
    multi: Multi,
    active: HashMap<u64, InFlight>,
    next_id: u64,
}

impl Driver for Multiplexer {
    fn turn(&mut self, handle: &Handle) -> usize {
        if self.active.is_empty() {
            return 0;
        }
        if let Err(err) = self.multi.perform() {
            tracing::error!(%err, "curl multi perform failed");
            return 0;
        }

        let mut progress = 0;

        // mid-flight: headers for SSE-style callers, chunks for streamers
        for inflight in self.active.values_mut() {
            if inflight.transfer.get_ref().headers_complete && !inflight.headers_dispatched {
                inflight.headers_dispatched = true;
                if let Some(on_headers) = inflight.on_headers.take() {
                    let status = inflight.transfer.response_code().unwrap_or(0) as u16;
                    let lines = inflight.transfer.get_ref().header_lines.clone();
                    let (headers, version) = parse_header_lines(&lines);
                    progress += 1;
                    handle.next_tick(move |h| on_headers(h, status, headers, version));
                }
            }

            let chunks = core::mem::take(&mut inflight.transfer.get_mut().pending_chunks);
            if let Some(on_chunk) = &inflight.on_chunk {
                progress += chunks.len();
                for chunk in chunks {
                    let on_chunk = Rc::clone(on_chunk);
                    handle.next_tick(move |h| (*on_chunk.borrow_mut())(h, chunk));
                }
            }
        }

        // completed transfers
        let mut finished: Vec<(u64, core::result::Result<(), String>)> = Vec::new();
        self.multi.messages(|message| {
            for (&id, inflight) in &self.active {
                if let Some(result) = message.result_for2(&inflight.transfer) {
                    finished.push((id, result.map_err(|err| err.to_string())));
                }
            }
        });

        for (id, result) in finished {
            let Some(mut inflight) = self.active.remove(&id) else {
                continue;
            };
            let status = inflight.transfer.response_code().unwrap_or(0) as u16;
            let on_done = inflight.on_done.take();

            let mut easy = match self.multi.remove2(inflight.transfer) {
                Ok(easy) => easy,
                Err(err) => {
                    tracing::error!(%err, transfer = id, "failed to detach finished transfer");
                    continue;
                }
            };
            let collector = easy.get_mut();
            let body = core::mem::take(&mut collector.body);
            let lines = core::mem::take(&mut collector.header_lines);
            let sink_error = collector.sink_error.take();
            let sink = collector.sink.take();
            let sink_path = collector.sink_path.take();
            drop(easy);

            let failed = result.is_err() || sink_error.is_some();
            if let Some(path) = sink_path {
                drop(sink);
                if failed {
                    // a broken download leaves no partial file behind
                    let _ = std::fs::remove_file(&path);
                }
            }

            let result = match sink_error {
                Some(message) => Err(message),
                None => result,
            };
            let (headers, version) = parse_header_lines(&lines);
            let outcome = TransferOutcome {
                result,
                status,
                headers,
                version,
                body,
            };
            tracing::debug!(transfer = id, status, "transfer finished");
            if let Some(on_done) = on_done {
                progress += 1;
                // completions run as micro-tasks so they may re-enter the
                // manager (retries, follow-up requests)
                handle.next_tick(move |h| on_done(h, outcome));
            }
        }
        progress
    }

    fn next_wakeup(&self) -> Option<Duration> {
        if self.active.is_empty() {
            return None;
        }
        let curl_deadline = self.multi.get_timeout().ok().flatten();
        Some(match curl_deadline {
            Some(deadline) => deadline.min(TRANSFER_POLL),
            None => TRANSFER_POLL,
        })
    }

    fn has_pending(&self) -> bool {
        !self.active.is_empty()
    }
}

/// Per-request control block: what cancellation must tear down.
struct RequestCtl {
    manager: HttpManager,
    transfer: Cell<Option<u64>>,
    retry_timer: Cell<Option<TimerId>>,
}

/// The multiplexed request manager bound to one event loop.
#[derive(Clone)]
pub struct HttpManager {
    handle: Handle,
    inner: Rc<RefCell<Multiplexer>>,
    default_cache: Rc<MemoryCache>,
}

// === impl HttpManager ===

impl HttpManager {
    /// Builds the manager and plugs it into the loop's tick pipeline.
    pub fn new(handle: &Handle) -> Self {
        let inner = Rc::new(RefCell::new(Multiplexer {
            multi: Multi::new(),
            active: HashMap::new(),
            next_id: 1,
        }));
        handle.register_driver(inner.clone());
        Self {
            handle: handle.clone(),
            inner,
            default_cache: Rc::new(MemoryCache::new()),
        }
    }

    /// The manager's shared in-memory cache backend.
    pub fn cache(&self) -> &MemoryCache {
        &self.default_cache
    }

    /// Performs a request through the cache+retry pipeline.
    ///
    /// The returned promise is cancellable: cancelling aborts the transfer,
    /// clears any pending retry timer, and removes a partial download file.
    pub fn fetch(&self, url: &str, options: RequestOptions) -> Promise<Response> {
        self.fetch_inner(url, options, None)
    }

    /// Like [`HttpManager::fetch`] with `stream` semantics: chunks are
    /// delivered to `on_chunk` as they arrive, and the promise resolves with
    /// a [`StreamingResponse`] over the buffered body.
    pub fn stream(
        &self,
        url: &str,
        mut options: RequestOptions,
        on_chunk: impl FnMut(&Handle, Vec<u8>) + 'static,
    ) -> Promise<StreamingResponse> {
        options.stream = true;
        options.cache = None;
        self.fetch_inner(url, options, Some(Rc::new(RefCell::new(on_chunk))))
            .map(StreamingResponse::new)
    }

    /// Downloads straight to `path`; on failure or cancellation the partial
    /// file is removed. The resolved response has an empty body.
    pub fn download(
        &self,
        url: &str,
        path: impl Into<PathBuf>,
        mut options: RequestOptions,
    ) -> Promise<Response> {
        options.save_to = Some(path.into());
        options.cache = None;
        self.fetch_inner(url, options, None)
    }

    fn fetch_inner(
        &self,
        url: &str,
        options: RequestOptions,
        on_chunk: Option<ChunkCallback>,
    ) -> Promise<Response> {
        if let Err(err) = url::Url::parse(url) {
            return self
                .handle
                .rejected(Error::Config(format!("invalid url `{url}`: {err}")));
        }

        let (promise, settler, cancel) = self.handle.cancellable::<Response>();
        let ctl = Rc::new(RequestCtl {
            manager: self.clone(),
            transfer: Cell::new(None),
            retry_timer: Cell::new(None),
        });
        {
            let ctl = Rc::clone(&ctl);
            cancel.on_cancel(move |handle| {
                if let Some(timer) = ctl.retry_timer.take() {
                    handle.cancel_timer(timer);
                }
                if let Some(id) = ctl.transfer.take() {
                    ctl.manager.abort(id);
                }
            });
        }

        // cache pipeline applies to GET only
        let cache = options
            .cache
            .clone()
            .filter(|_| options.method == Method::Get);
        let mut extra_headers = Vec::new();
        let mut stale: Option<CachedResponse> = None;

        if let Some(config) = &cache {
            let backend = self.backend(config);
            let key = cache_key(url);
            if let Some(entry) = backend.get(&key) {
                if unix_now() < entry.expires_at {
                    tracing::debug!(key = %key, "cache hit, serving without network");
                    settler.fulfil(cached_as_response(&entry));
                    return promise;
                }
                if config.respect_server_headers {
                    if let Some(etag) = entry.headers.get("etag") {
                        extra_headers.push(format!("If-None-Match: {etag}"));
                    }
                    if let Some(modified) = entry.headers.get("last-modified") {
                        extra_headers.push(format!("If-Modified-Since: {modified}"));
                    }
                }
                stale = Some(entry);
            }
        }

        let complete: CompleteCallback = {
            let manager = self.clone();
            let key = cache.as_ref().map(|_| cache_key(url));
            Box::new(move |_handle, result| match result {
                Ok(response) => {
                    let response = match (&cache, &key) {
                        (Some(config), Some(key)) => {
                            store_back(&manager, config, key, response, stale)
                        }
                        _ => response,
                    };
                    settler.fulfil(response);
                }
                Err(err) => settler.reject(err),
            })
        };

        dispatch_with_retries(
            self.clone(),
            url.to_string(),
            Rc::new(options),
            Rc::new(extra_headers),
            ctl,
            1,
            Rc::new(RefCell::new(Some(complete))),
            on_chunk,
        );
        promise
    }

    /// Opens a Server-Sent Events stream.
    ///
    /// The promise resolves with the [`SseHandle`] as soon as response
    /// headers arrive; events keep flowing through `on_event`. With
    /// reconnection enabled, a dropped transport reconnects with
    /// exponential backoff, carrying `Last-Event-ID`, until `max_attempts`
    /// is exhausted — the terminal error then reaches `on_error` (and the
    /// promise, if headers never arrived).
    pub fn sse(
        &self,
        url: &str,
        options: RequestOptions,
        reconnect: SseReconnectConfig,
        on_event: impl FnMut(&Handle, SseEvent) + 'static,
        on_error: impl FnOnce(&Handle, Error) + 'static,
    ) -> Promise<SseHandle> {
        if let Err(err) = url::Url::parse(url) {
            return self
                .handle
                .rejected(Error::Config(format!("invalid url `{url}`: {err}")));
        }

        let (promise, settler, cancel) = self.handle.cancellable::<SseHandle>();
        let sse = SseHandle::new();
        {
            let sse = sse.clone();
            cancel.on_cancel(move |_handle| sse.close());
        }

        let session = Rc::new(SseSession {
            manager: self.clone(),
            url: url.to_string(),
            options: Rc::new(options),
            reconnect,
            sse: sse.clone(),
            on_event: Rc::new(RefCell::new(on_event)),
            on_error: RefCell::new(Some(Box::new(on_error))),
            resolve: RefCell::new(Some(settler)),
            retry_override: Cell::new(None),
        });
        sse_connect(&session);
        promise
    }

    fn backend(&self, config: &crate::cache::CacheConfig) -> Rc<dyn CacheBackend> {
        match &config.backend {
            Some(backend) => Rc::clone(backend),
            None => Rc::clone(&self.default_cache) as Rc<dyn CacheBackend>,
        }
    }

    /// Hands a prepared transfer to the multi; completion and dispatch
    /// callbacks fire from the driver turn.
    fn begin(
        &self,
        easy: Easy2<Collector>,
        on_done: Box<dyn FnOnce(&Handle, TransferOutcome)>,
        on_chunk: Option<ChunkCallback>,
        on_headers: Option<HeaderCallback>,
    ) -> Result<u64> {
        let mut inner = self.inner.borrow_mut();
        let transfer = inner.multi.add2(easy).map_err(|err| Error::Http {
            status: None,
            message: format!("failed to start transfer: {err}"),
        })?;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.active.insert(
            id,
            InFlight {
                transfer,
                on_done: Some(on_done),
                on_chunk,
                on_headers,
                headers_dispatched: false,
            },
        );
        tracing::debug!(transfer = id, "transfer started");
        Ok(id)
    }

    /// Aborts an in-flight transfer: detaches it from the multi and removes
    /// a partial download file. The completion callback never fires.
    fn abort(&self, id: u64) {
        let mut inner = self.inner.borrow_mut();
        let Some(inflight) = inner.active.remove(&id) else {
            return;
        };
        tracing::debug!(transfer = id, "transfer aborted");
        match inner.multi.remove2(inflight.transfer) {
            Ok(mut easy) => {
                let collector = easy.get_mut();
                collector.sink.take();
                if let Some(path) = collector.sink_path.take() {
                    let _ = std::fs::remove_file(&path);
                }
            }
            Err(err) => tracing::error!(%err, transfer = id, "failed to detach aborted transfer"),
        }
    }
}

fn cached_as_response(entry: &CachedResponse) -> Response {
    Response {
        status: entry.status,
        headers: entry.headers.clone(),
        body: entry.body.clone(),
        version: String::new(),
    }
}

/// The store-back half of the cache pipeline: a `304` refreshes and serves
/// the stored entry as a `200`; a cacheable `2xx` replaces it.
fn store_back(
    manager: &HttpManager,
    config: &crate::cache::CacheConfig,
    key: &str,
    response: Response,
    stale: Option<CachedResponse>,
) -> Response {
    let backend = manager.backend(config);
    if response.status == 304
        && let Some(entry) = stale
    {
        tracing::debug!(key = %key, "revalidated, refreshing stored entry");
        let expires = expires_at(config, &response);
        backend.put(
            key,
            CachedResponse {
                body: entry.body.clone(),
                status: entry.status,
                headers: entry.headers.clone(),
                expires_at: expires,
            },
        );
        return Response {
            status: 200,
            headers: entry.headers,
            body: entry.body,
            version: response.version,
        };
    }
    if is_cacheable(config, &response) {
        backend.put(
            key,
            CachedResponse {
                body: response.body.clone(),
                status: response.status,
                headers: response.headers.clone(),
                expires_at: expires_at(config, &response),
            },
        );
    }
    response
}

/// One dispatch attempt plus the retry ladder.
#[expect(clippy::too_many_arguments, reason = "internal pipeline plumbing")]
fn dispatch_with_retries(
    manager: HttpManager,
    url: String,
    options: Rc<RequestOptions>,
    extra_headers: Rc<Vec<String>>,
    ctl: Rc<RequestCtl>,
    attempt: u32,
    complete: Rc<RefCell<Option<CompleteCallback>>>,
    on_chunk: Option<ChunkCallback>,
) {
    let easy = match build_easy(&url, &options, &extra_headers, options.stream, true) {
        Ok(easy) => easy,
        Err(err) => {
            if let Some(complete) = complete.borrow_mut().take() {
                manager.handle.next_tick(move |h| complete(h, Err(err)));
            }
            return;
        }
    };

    let on_done: Box<dyn FnOnce(&Handle, TransferOutcome)> = {
        let manager = manager.clone();
        let ctl = Rc::clone(&ctl);
        let complete = Rc::clone(&complete);
        let on_chunk = on_chunk.clone();
        let options_for_retry = Rc::clone(&options);
        let extra_headers = Rc::clone(&extra_headers);
        Box::new(move |handle, outcome| {
            ctl.transfer.set(None);
            let result = outcome_to_result(outcome);

            if let Some(retry) = &options_for_retry.retry {
                let eligible = attempt <= retry.max_retries
                    && match &result {
                        Ok(response) => retry.retryable_status(response.status),
                        Err(err) => retry.retryable_error(err),
                    };
                if eligible {
                    let delay = retry.delay_for(attempt);
                    tracing::debug!(
                        attempt,
                        ?delay,
                        "transfer retryable, scheduling re-issue"
                    );
                    let retry_ctl = Rc::clone(&ctl);
                    let timer = handle.add_timer(delay, move |_h| {
                        retry_ctl.retry_timer.set(None);
                        let ctl = Rc::clone(&retry_ctl);
                        dispatch_with_retries(
                            manager,
                            url,
                            options_for_retry,
                            extra_headers,
                            ctl,
                            attempt + 1,
                            complete,
                            on_chunk,
                        );
                    });
                    ctl.retry_timer.set(Some(timer));
                    return;
                }
            }
            if let Some(complete) = complete.borrow_mut().take() {
                complete(handle, result);
            }
        })
    };

    match manager.begin(easy, on_done, on_chunk, None) {
        Ok(id) => ctl.transfer.set(Some(id)),
        Err(err) => {
            if let Some(complete) = complete.borrow_mut().take() {
                manager.handle.next_tick(move |h| complete(h, Err(err)));
            }
        }
    }
}

fn outcome_to_result(outcome: TransferOutcome) -> Result<Response> {
    match outcome.result {
        Ok(()) => Ok(Response {
            status: outcome.status,
            headers: outcome.headers,
            body: outcome.body,
            version: outcome.version,
        }),
        Err(message) => Err(Error::Http {
            status: None,
            message,
        }),
    }
}

/// Builds the configured easy handle for one attempt. `collect_chunks`
/// queues arriving data for per-chunk dispatch; `buffer_body` keeps the
/// full body in memory (off for downloads and unbounded event streams).
fn build_easy(
    url: &str,
    options: &RequestOptions,
    extra_headers: &[String],
    collect_chunks: bool,
    buffer_body: bool,
) -> Result<Easy2<Collector>> {
    let sink = match &options.save_to {
        Some(path) => {
            let file = File::create(path)
                .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
            Some((file, path.clone()))
        }
        None => None,
    };
    let buffer_body = buffer_body && sink.is_none();
    let encoded_body = options.encoded_body()?;
    let mut easy = Easy2::new(Collector::new(buffer_body, collect_chunks, sink));

    let setup = |easy: &mut Easy2<Collector>| -> core::result::Result<(), curl::Error> {
        easy.url(url)?;
        match &options.method {
            Method::Get => easy.get(true)?,
            Method::Head => easy.nobody(true)?,
            Method::Post => easy.post(true)?,
            other => easy.custom_request(other.as_str())?,
        }

        let mut implied_content_type = None;
        if let Some((body, content_type)) = &encoded_body {
            easy.post_fields_copy(body)?;
            if !matches!(options.method, Method::Post) {
                // post_fields implies POST; restate the requested method
                easy.custom_request(options.method.as_str())?;
            }
            implied_content_type = *content_type;
        }

        let mut headers = List::new();
        let user_sets_content_type = options
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        if let Some(content_type) = implied_content_type
            && !user_sets_content_type
        {
            headers.append(&format!("Content-Type: {content_type}"))?;
        }
        for (name, value) in &options.headers {
            headers.append(&format!("{name}: {value}"))?;
        }
        if let Some(Auth::Bearer(token)) = &options.auth {
            headers.append(&format!("Authorization: Bearer {token}"))?;
        }
        for line in extra_headers {
            headers.append(line)?;
        }
        easy.http_headers(headers)?;

        if let Some(Auth::Basic { username, password }) = &options.auth {
            easy.username(username)?;
            easy.password(password)?;
        }
        if let Some(timeout) = options.timeout {
            easy.timeout(timeout)?;
        }
        if let Some(connect_timeout) = options.connect_timeout {
            easy.connect_timeout(connect_timeout)?;
        }
        easy.follow_location(options.follow_redirects)?;
        if let Some(max) = options.max_redirects {
            easy.max_redirections(max)?;
        }
        easy.ssl_verify_peer(options.verify_ssl)?;
        easy.ssl_verify_host(options.verify_ssl)?;
        easy.useragent(options.user_agent.as_deref().unwrap_or("strand-http/0.1"))?;
        if let Some(version) = options.http_version {
            easy.http_version(match version {
                HttpVersionPref::V10 => HttpVersion::V10,
                HttpVersionPref::V11 => HttpVersion::V11,
                HttpVersionPref::V2 => HttpVersion::V2,
                HttpVersionPref::V3 => HttpVersion::V3,
            })?;
        }
        if let Some(proxy) = &options.proxy {
            easy.proxy(&proxy.to_proxy_url())?;
            if let Some((username, password)) = proxy.credentials() {
                easy.proxy_username(&username)?;
                if let Some(password) = password {
                    easy.proxy_password(&password)?;
                }
            }
        }
        Ok(())
    };

    setup(&mut easy).map_err(|err| Error::Config(format!("request setup failed: {err}")))?;
    Ok(easy)
}

// === SSE session ===

struct SseSession {
    manager: HttpManager,
    url: String,
    options: Rc<RequestOptions>,
    reconnect: SseReconnectConfig,
    sse: SseHandle,
    on_event: Rc<RefCell<dyn FnMut(&Handle, SseEvent)>>,
    on_error: RefCell<Option<Box<dyn FnOnce(&Handle, Error)>>>,
    resolve: RefCell<Option<Settler<SseHandle>>>,
    retry_override: Cell<Option<Duration>>,
}

/// Opens (or re-opens) the event-stream transfer.
fn sse_connect(session: &Rc<SseSession>) {
    if session.sse.is_closed() {
        return;
    }

    let mut extra_headers = vec![
        "Accept: text/event-stream".to_string(),
        "Cache-Control: no-cache".to_string(),
    ];
    if let Some(last_id) = session.sse.last_event_id() {
        extra_headers.push(format!("Last-Event-ID: {last_id}"));
    }

    // chunks feed the parser; an endless stream is never buffered whole
    let easy = match build_easy(&session.url, &session.options, &extra_headers, true, false) {
        Ok(easy) => easy,
        Err(err) => {
            sse_transfer_ended(session, err);
            return;
        }
    };

    let parser = Rc::new(RefCell::new(SseParser::new()));
    let on_chunk: ChunkCallback = {
        let session = Rc::clone(session);
        let parser = Rc::clone(&parser);
        Rc::new(RefCell::new(move |handle: &Handle, chunk: Vec<u8>| {
            let events = parser.borrow_mut().feed(&chunk);
            for event in events {
                if let Some(id) = &event.id {
                    session
                        .sse
                        .inner
                        .last_event_id
                        .replace(Some(id.clone()));
                }
                if let Some(retry) = event.retry {
                    session.retry_override.set(Some(retry));
                }
                if !session.sse.is_closed() {
                    (*session.on_event.borrow_mut())(handle, event);
                }
            }
        }))
    };

    let on_headers: HeaderCallback = {
        let session = Rc::clone(session);
        Box::new(move |_handle, status, _headers, _version| {
            session.sse.inner.status.set(status);
            // a live connection resets the reconnect counter
            session.sse.inner.attempts.set(0);
            if let Some(settler) = session.resolve.borrow_mut().take() {
                tracing::debug!(status, "sse stream open");
                settler.fulfil(session.sse.clone());
            }
        })
    };

    let on_done: Box<dyn FnOnce(&Handle, TransferOutcome)> = {
        let session = Rc::clone(session);
        Box::new(move |_handle, outcome| {
            let err = match outcome.result {
                Err(message) => Error::Stream(message),
                Ok(()) => Error::Stream(format!(
                    "event stream ended (status {})",
                    outcome.status
                )),
            };
            sse_transfer_ended(&session, err);
        })
    };

    match session
        .manager
        .begin(easy, on_done, Some(on_chunk), Some(on_headers))
    {
        Ok(id) => {
            let manager = session.manager.clone();
            session
                .sse
                .inner
                .abort
                .replace(Some(Box::new(move || manager.abort(id))));
        }
        Err(err) => sse_transfer_ended(session, err),
    }
}

/// Failure/End handling: reconnect with backoff or surface the error.
fn sse_transfer_ended(session: &Rc<SseSession>, err: Error) {
    if session.sse.is_closed() {
        return;
    }
    let attempts = session.sse.inner.attempts.get();
    let config = &session.reconnect;

    let eligible = config.enabled && attempts < config.max_attempts && config.wants_reconnect(&err);
    if eligible {
        let attempt = attempts + 1;
        session.sse.inner.attempts.set(attempt);
        let delay = session
            .retry_override
            .take()
            .unwrap_or_else(|| config.delay_for(attempt));
        tracing::debug!(attempt, ?delay, %err, "sse reconnecting");
        if let Some(on_reconnect) = &config.on_reconnect {
            on_reconnect(attempt, delay, &err);
        }

        let handle = session.manager.handle.clone();
        let waiting = Rc::clone(session);
        let timer = handle.add_timer(delay, move |_h| {
            sse_connect(&waiting);
        });
        // closing during the wait cancels the pending reconnect
        session.sse.inner.abort.replace(Some(Box::new(move || {
            handle.cancel_timer(timer);
        })));
        return;
    }

    tracing::debug!(%err, "sse stream terminal");
    if let Some(settler) = session.resolve.borrow_mut().take() {
        settler.reject(err.clone());
    }
    if let Some(on_error) = session.on_error.borrow_mut().take() {
        let handle = session.manager.handle.clone();
        handle.next_tick(move |h| on_error(h, err));
    }
}
