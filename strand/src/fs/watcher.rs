// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Polling path watchers.
//!
//! A watcher snapshots the watched tree on the blocking pool at a fixed
//! cadence and diffs consecutive snapshots on the loop thread. A deletion
//! and a creation with identical size and mtime inside one scan are paired
//! as a `moved` event (snapshot diffing cannot observe a true rename).
//! Include/exclude globs and the event-kind filter run before debouncing;
//! debounce collapses repeats for the same `(path, kind)` inside the window.

use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::collections::HashMap;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Instant, SystemTime};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};
use crate::event_loop::Handle;
use crate::time::TimerId;

/// Event kinds a watcher can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
    Attributes,
}

/// A change observed under the watched path.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
    /// For `Moved`: where the entry previously lived.
    pub previous: Option<PathBuf>,
}

/// Watcher registration options.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub recursive: bool,
    /// Kinds to report; empty means all.
    pub events: Vec<WatchEventKind>,
    /// Collapse repeated events for the same path+kind inside this window.
    pub debounce: Duration,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Snapshot cadence.
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            events: Vec::new(),
            debounce: Duration::ZERO,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Identifies a registered watcher for [`unwatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherId(TimerId);

#[derive(Debug, Clone, PartialEq)]
struct FileSig {
    len: u64,
    mtime: Option<SystemTime>,
    mode: u32,
    is_dir: bool,
}

type Snapshot = HashMap<PathBuf, FileSig>;

struct WatchState {
    baseline: RefCell<Option<Snapshot>>,
    scanning: Cell<bool>,
    last_emit: RefCell<HashMap<(PathBuf, WatchEventKind), Instant>>,
    callback: RefCell<Box<dyn FnMut(&Handle, WatchEvent)>>,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    options: WatchOptions,
}

/// Registers a polling watcher over `path`.
///
/// The first completed scan establishes the baseline; changes are reported
/// relative to it from then on. Fails with [`Error::Config`] on an invalid
/// glob pattern.
pub fn watch(
    handle: &Handle,
    path: impl Into<PathBuf>,
    options: WatchOptions,
    callback: impl FnMut(&Handle, WatchEvent) + 'static,
) -> Result<WatcherId> {
    let path = path.into();
    let include = build_globset(&options.include_patterns)?;
    let exclude = build_globset(&options.exclude_patterns)?;
    let poll_interval = options.poll_interval;

    let state = Rc::new(WatchState {
        baseline: RefCell::new(None),
        scanning: Cell::new(false),
        last_emit: RefCell::new(HashMap::new()),
        callback: RefCell::new(Box::new(callback)),
        include,
        exclude,
        options,
    });

    let timer = handle.interval(poll_interval, move |handle| {
        if state.scanning.replace(true) {
            // previous scan still in flight, skip this cadence point
            return;
        }
        let scan_path = path.clone();
        let recursive = state.options.recursive;
        let state = Rc::clone(&state);
        handle
            .spawn_blocking(move || Ok(scan(&scan_path, recursive)))
            .subscribe(move |handle, result| {
                state.scanning.set(false);
                match result {
                    Ok(snapshot) => {
                        let previous = state.baseline.borrow_mut().replace(snapshot.clone());
                        if let Some(previous) = previous {
                            emit_changes(handle, &state, &previous, &snapshot);
                        }
                    }
                    Err(err) => tracing::debug!(%err, "watcher scan failed"),
                }
            });
    });

    tracing::debug!(watcher = ?timer, "path watcher registered");
    Ok(WatcherId(timer))
}

/// Detaches a watcher; pending scan results are discarded silently.
pub fn unwatch(handle: &Handle, id: WatcherId) -> bool {
    handle.cancel_timer(id.0)
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|err| Error::Config(format!("invalid glob `{pattern}`: {err}")))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|err| Error::Config(format!("invalid glob set: {err}")))?;
    Ok(Some(set))
}

fn scan(root: &Path, recursive: bool) -> Snapshot {
    let mut snapshot = Snapshot::new();
    let Ok(meta) = fs::symlink_metadata(root) else {
        return snapshot;
    };
    if meta.is_dir() {
        scan_dir(root, recursive, &mut snapshot);
    } else {
        snapshot.insert(root.to_path_buf(), sig_of(&meta));
    }
    snapshot
}

fn scan_dir(dir: &Path, recursive: bool, snapshot: &mut Snapshot) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        let sig = sig_of(&meta);
        let is_dir = sig.is_dir;
        snapshot.insert(path.clone(), sig);
        if is_dir && recursive {
            scan_dir(&path, recursive, snapshot);
        }
    }
}

fn sig_of(meta: &fs::Metadata) -> FileSig {
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = u32::from(meta.permissions().readonly());

    FileSig {
        len: meta.len(),
        mtime: meta.modified().ok(),
        mode,
        is_dir: meta.is_dir(),
    }
}

fn emit_changes(handle: &Handle, state: &WatchState, old: &Snapshot, new: &Snapshot) {
    let mut deleted: HashMap<&PathBuf, &FileSig> = old
        .iter()
        .filter(|(path, _)| !new.contains_key(*path))
        .collect();
    let mut events = Vec::new();

    let mut created: Vec<(&PathBuf, &FileSig)> = new
        .iter()
        .filter(|(path, _)| !old.contains_key(*path))
        .collect();
    created.sort_by_key(|(path, _)| (*path).clone());

    for (path, sig) in created {
        // pair a same-signature deletion with this creation as a move
        let moved_from = deleted
            .iter()
            .find(|(_, old_sig)| {
                !sig.is_dir && old_sig.len == sig.len && old_sig.mtime == sig.mtime
            })
            .map(|(old_path, _)| (*old_path).clone());
        match moved_from {
            Some(previous) => {
                deleted.remove(&previous);
                events.push(WatchEvent {
                    path: path.clone(),
                    kind: WatchEventKind::Moved,
                    previous: Some(previous),
                });
            }
            None => events.push(WatchEvent {
                path: path.clone(),
                kind: WatchEventKind::Created,
                previous: None,
            }),
        }
    }

    for (path, new_sig) in new {
        if let Some(old_sig) = old.get(path)
            && old_sig != new_sig
        {
            let kind = if old_sig.len == new_sig.len
                && old_sig.mtime == new_sig.mtime
                && old_sig.mode != new_sig.mode
            {
                WatchEventKind::Attributes
            } else {
                WatchEventKind::Modified
            };
            events.push(WatchEvent {
                path: path.clone(),
                kind,
                previous: None,
            });
        }
    }

    let mut removed: Vec<&PathBuf> = deleted.keys().copied().collect();
    removed.sort();
    for path in removed {
        events.push(WatchEvent {
            path: path.clone(),
            kind: WatchEventKind::Deleted,
            previous: None,
        });
    }

    for event in events {
        if !state.options.events.is_empty() && !state.options.events.contains(&event.kind) {
            continue;
        }
        if let Some(include) = &state.include
            && !include.is_match(&event.path)
        {
            continue;
        }
        if let Some(exclude) = &state.exclude
            && exclude.is_match(&event.path)
        {
            continue;
        }
        if state.options.debounce > Duration::ZERO {
            let key = (event.path.clone(), event.kind);
            let now = Instant::now();
            let mut last_emit = state.last_emit.borrow_mut();
            if let Some(last) = last_emit.get(&key)
                && now.duration_since(*last) < state.options.debounce
            {
                continue;
            }
            last_emit.insert(key, now);
        }

        tracing::trace!(path = %event.path.display(), kind = ?event.kind, "watch event");
        let mut callback = state.callback.borrow_mut();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (*callback)(handle, event))) {
            let err = Error::from_panic(payload);
            tracing::error!(%err, "watcher callback panicked");
        }
    }
}
