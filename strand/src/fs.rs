// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-blocking file and directory operations.
//!
//! Every operation runs on the blocking pool and settles its promise from
//! the loop's completion drain. Atomic writes stage the content in a
//! temporary file in the target directory and rename it into place, so the
//! target always holds either the old content or the complete new content.

pub mod watcher;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::event_loop::Handle;
use crate::promise::Promise;

pub use watcher::{WatchEvent, WatchEventKind, WatchOptions, WatcherId, unwatch, watch};

/// Options recognized by [`read`] and [`read_to_string`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Only `"utf-8"` (and `None`) are meaningful on this platform; recorded
    /// for callers that carry encodings through.
    pub encoding: Option<String>,
    pub offset: Option<u64>,
    pub length: Option<u64>,
}

/// Options recognized by [`write`] and [`append`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Open mode: `"w"` truncate (default), `"a"` append, `"x"` create-new.
    pub mode: Option<String>,
    /// Unix permission bits applied to the target after the write.
    pub permissions: Option<u32>,
    /// Create missing parent directories first.
    pub create_dirs: bool,
    /// Take an exclusive advisory lock for the duration of the write.
    pub lock: bool,
    /// Stage in a temp file and rename into place (crash-safe).
    pub atomic: bool,
}

/// Options recognized by [`mkdir`] and [`rmdir`].
#[derive(Debug, Clone, Default)]
pub struct DirOptions {
    /// Unix permission bits for created directories.
    pub mode: Option<u32>,
    pub recursive: bool,
}

/// A snapshot of a path's metadata.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub len: u64,
    pub is_dir: bool,
    pub is_file: bool,
    pub modified: Option<SystemTime>,
    pub permissions: Option<u32>,
}

const STREAM_CHUNK: usize = 64 * 1024;

/// Reads a file, honouring `offset`/`length`.
pub fn read(handle: &Handle, path: impl Into<PathBuf>, options: ReadOptions) -> Promise<Vec<u8>> {
    let path = path.into();
    handle.spawn_blocking(move || read_sync(&path, &options))
}

/// Reads a file as UTF-8 text.
pub fn read_to_string(
    handle: &Handle,
    path: impl Into<PathBuf>,
    options: ReadOptions,
) -> Promise<String> {
    let path = path.into();
    handle.spawn_blocking(move || {
        if let Some(encoding) = &options.encoding
            && !encoding.eq_ignore_ascii_case("utf-8")
            && !encoding.eq_ignore_ascii_case("utf8")
        {
            return Err(Error::Config(format!("unsupported encoding `{encoding}`")));
        }
        let bytes = read_sync(&path, &options)?;
        String::from_utf8(bytes)
            .map_err(|err| Error::File(format!("{}: invalid utf-8: {err}", path.display())))
    })
}

/// Writes `data` to `path` per the options (truncate by default).
pub fn write(
    handle: &Handle,
    path: impl Into<PathBuf>,
    data: Vec<u8>,
    options: WriteOptions,
) -> Promise<()> {
    let path = path.into();
    handle.spawn_blocking(move || write_sync(&path, &data, &options))
}

/// Appends `data` to `path`, creating the file if missing.
pub fn append(handle: &Handle, path: impl Into<PathBuf>, data: Vec<u8>) -> Promise<()> {
    let path = path.into();
    handle.spawn_blocking(move || {
        let options = WriteOptions {
            mode: Some("a".into()),
            ..WriteOptions::default()
        };
        write_sync(&path, &data, &options)
    })
}

pub fn stat(handle: &Handle, path: impl Into<PathBuf>) -> Promise<Metadata> {
    let path = path.into();
    handle.spawn_blocking(move || {
        let meta = fs::metadata(&path)
            .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
        Ok(metadata_of(&meta))
    })
}

pub fn exists(handle: &Handle, path: impl Into<PathBuf>) -> Promise<bool> {
    let path = path.into();
    handle.spawn_blocking(move || Ok(path.exists()))
}

pub fn delete(handle: &Handle, path: impl Into<PathBuf>) -> Promise<()> {
    let path = path.into();
    handle.spawn_blocking(move || {
        fs::remove_file(&path).map_err(|err| Error::File(format!("{}: {err}", path.display())))
    })
}

/// Copies `src` to `dst`; fulfils with the number of bytes copied.
pub fn copy(handle: &Handle, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Promise<u64> {
    let (src, dst) = (src.into(), dst.into());
    handle.spawn_blocking(move || {
        fs::copy(&src, &dst)
            .map_err(|err| Error::File(format!("{} -> {}: {err}", src.display(), dst.display())))
    })
}

pub fn rename(handle: &Handle, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Promise<()> {
    let (src, dst) = (src.into(), dst.into());
    handle.spawn_blocking(move || {
        fs::rename(&src, &dst)
            .map_err(|err| Error::File(format!("{} -> {}: {err}", src.display(), dst.display())))
    })
}

pub fn mkdir(handle: &Handle, path: impl Into<PathBuf>, options: DirOptions) -> Promise<()> {
    let path = path.into();
    handle.spawn_blocking(move || {
        let result = if options.recursive {
            fs::create_dir_all(&path)
        } else {
            fs::create_dir(&path)
        };
        result.map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
        apply_permissions(&path, options.mode)
    })
}

pub fn rmdir(handle: &Handle, path: impl Into<PathBuf>, options: DirOptions) -> Promise<()> {
    let path = path.into();
    handle.spawn_blocking(move || {
        let result = if options.recursive {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_dir(&path)
        };
        result.map_err(|err| Error::File(format!("{}: {err}", path.display())))
    })
}

/// Lists directory entries (names, not recursive).
pub fn list(handle: &Handle, path: impl Into<PathBuf>) -> Promise<Vec<PathBuf>> {
    let path = path.into();
    handle.spawn_blocking(move || {
        let mut entries = Vec::new();
        let dir =
            fs::read_dir(&path).map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
        for entry in dir {
            let entry =
                entry.map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
            entries.push(entry.path());
        }
        entries.sort();
        Ok(entries)
    })
}

/// Streams a file through `on_chunk` in chunk-sized reads; fulfils with the
/// total byte count. Chunks are delivered on the loop thread, in order.
pub fn stream_read(
    handle: &Handle,
    path: impl Into<PathBuf>,
    chunk_size: Option<usize>,
    on_chunk: impl FnMut(&Handle, Vec<u8>) + 'static,
) -> Promise<u64> {
    let path = path.into();
    let chunk_size = chunk_size.unwrap_or(STREAM_CHUNK).max(1);
    let (promise, settler) = handle.promise::<u64>();
    next_chunk(handle, path, chunk_size, 0, Box::new(on_chunk), settler);
    promise
}

fn next_chunk(
    handle: &Handle,
    path: PathBuf,
    chunk_size: usize,
    offset: u64,
    mut on_chunk: Box<dyn FnMut(&Handle, Vec<u8>) + 'static>,
    settler: crate::promise::Settler<u64>,
) {
    let read_path = path.clone();
    let options = ReadOptions {
        encoding: None,
        offset: Some(offset),
        length: Some(chunk_size as u64),
    };
    handle
        .spawn_blocking(move || read_sync(&read_path, &options))
        .subscribe(move |handle, result| match result {
            Ok(chunk) if chunk.is_empty() => settler.fulfil(offset),
            Ok(chunk) => {
                let advanced = offset + chunk.len() as u64;
                on_chunk(handle, chunk);
                next_chunk(handle, path, chunk_size, advanced, on_chunk, settler);
            }
            Err(err) => settler.reject(err),
        });
}

/// Writes a sequence of chunks to `path` in one pass.
pub fn stream_write(
    handle: &Handle,
    path: impl Into<PathBuf>,
    chunks: Vec<Vec<u8>>,
    options: WriteOptions,
) -> Promise<u64> {
    let path = path.into();
    handle.spawn_blocking(move || {
        let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        let data: Vec<u8> = chunks.concat();
        write_sync(&path, &data, &options)?;
        Ok(total)
    })
}

/// Copies `src` to `dst` in buffered chunks; fulfils with the byte count.
pub fn stream_copy(
    handle: &Handle,
    src: impl Into<PathBuf>,
    dst: impl Into<PathBuf>,
) -> Promise<u64> {
    let (src, dst) = (src.into(), dst.into());
    handle.spawn_blocking(move || {
        let mut from = File::open(&src)
            .map_err(|err| Error::File(format!("{}: {err}", src.display())))?;
        let mut to = File::create(&dst)
            .map_err(|err| Error::File(format!("{}: {err}", dst.display())))?;
        let mut buf = vec![0_u8; STREAM_CHUNK];
        let mut total = 0_u64;
        loop {
            let n = from
                .read(&mut buf)
                .map_err(|err| Error::File(format!("{}: {err}", src.display())))?;
            if n == 0 {
                break;
            }
            to.write_all(&buf[..n])
                .map_err(|err| Error::File(format!("{}: {err}", dst.display())))?;
            total += n as u64;
        }
        Ok(total)
    })
}

// === sync bodies (blocking pool) ===

fn read_sync(path: &Path, options: &ReadOptions) -> Result<Vec<u8>> {
    let mut file =
        File::open(path).map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
    if let Some(offset) = options.offset {
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
    }
    let mut buf = Vec::new();
    match options.length {
        Some(length) => {
            let mut take = file.take(length);
            take.read_to_end(&mut buf)
                .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
        }
        None => {
            file.read_to_end(&mut buf)
                .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
        }
    }
    Ok(buf)
}

fn write_sync(path: &Path, data: &[u8], options: &WriteOptions) -> Result<()> {
    if options.create_dirs
        && let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|err| Error::File(format!("{}: {err}", parent.display())))?;
    }

    if options.atomic {
        return write_atomic(path, data, options);
    }

    let mode = options.mode.as_deref().unwrap_or("w");
    let mut open = OpenOptions::new();
    match mode {
        "w" => open.write(true).create(true).truncate(true),
        "a" => open.append(true).create(true),
        "x" => open.write(true).create_new(true),
        other => {
            return Err(Error::Config(format!("unsupported write mode `{other}`")));
        }
    };
    let mut file = open
        .open(path)
        .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
    if options.lock {
        file.lock()
            .map_err(|err| Error::File(format!("{}: lock failed: {err}", path.display())))?;
    }
    file.write_all(data)
        .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
    file.sync_all()
        .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
    drop(file);
    apply_permissions(path, options.permissions)
}

/// Stage-then-rename: the target either keeps its prior content or gains
/// the complete new content, never a torn write.
fn write_atomic(path: &Path, data: &[u8], options: &WriteOptions) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let mut staged = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|err| Error::File(format!("{}: temp file: {err}", path.display())))?;
    staged
        .write_all(data)
        .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|err| Error::File(format!("{}: {err}", path.display())))?;
    staged
        .persist(path)
        .map_err(|err| Error::File(format!("{}: rename: {err}", path.display())))?;
    apply_permissions(path, options.permissions)
}

#[cfg(unix)]
fn apply_permissions(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|err| Error::File(format!("{}: chmod: {err}", path.display())))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_permissions(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

fn metadata_of(meta: &fs::Metadata) -> Metadata {
    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        Some(meta.permissions().mode())
    };
    #[cfg(not(unix))]
    let permissions = None;

    Metadata {
        len: meta.len(),
        is_dir: meta.is_dir(),
        is_file: meta.is_file(),
        modified: meta.modified().ok(),
        permissions,
    }
}
