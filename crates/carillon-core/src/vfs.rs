//! Byte-stream file abstraction consumed by the audio engine.
//!
//! All decode-time I/O goes through [`ByteStream`] handles obtained from a
//! [`Vfs`]. The engine never touches the filesystem directly; hosts plug in
//! their own virtual filesystem, or use [`DiskVfs`] / [`MemoryVfs`].

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::path::normalize_path;

/// An open, seekable file-like handle. Closing is dropping.
pub trait ByteStream: Send + Sync {
    /// Read up to `buf.len()` bytes. A count shorter than requested means the
    /// end of the stream was reached.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Seek to an absolute byte offset.
    fn seek(&mut self, offset: u64) -> io::Result<()>;

    /// Current absolute byte offset.
    fn tell(&mut self) -> io::Result<u64>;

    /// Whether the read position is at or past the end of the stream.
    fn eof(&mut self) -> bool;
}

/// Source of byte streams, addressed by normalized path.
pub trait Vfs: Send + Sync {
    /// Open a file for reading.
    fn open(&self, path: &str) -> io::Result<Box<dyn ByteStream>>;

    /// Size of a file in bytes.
    fn size(&self, path: &str) -> io::Result<u64>;

    /// Whether a file exists.
    fn exists(&self, path: &str) -> bool {
        self.size(path).is_ok()
    }
}

/// VFS backed by a directory on disk.
#[derive(Debug, Clone)]
pub struct DiskVfs {
    root: PathBuf,
}

impl DiskVfs {
    /// Create a VFS resolving paths relative to `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let normalized = normalize_path(path);
        if normalized.starts_with('/') {
            PathBuf::from(normalized)
        } else {
            self.root.join(normalized)
        }
    }
}

impl Vfs for DiskVfs {
    fn open(&self, path: &str) -> io::Result<Box<dyn ByteStream>> {
        let file = File::open(self.resolve(path))?;
        let len = file.metadata()?.len();
        Ok(Box::new(DiskStream { file, len, pos: 0 }))
    }

    fn size(&self, path: &str) -> io::Result<u64> {
        let metadata = std::fs::metadata(self.resolve(path))?;
        if metadata.is_file() {
            Ok(metadata.len())
        } else {
            Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"))
        }
    }
}

struct DiskStream {
    file: File,
    len: u64,
    pos: u64,
}

impl ByteStream for DiskStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.pos += total as u64;
        Ok(total)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.pos = self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn tell(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }

    fn eof(&mut self) -> bool {
        self.pos >= self.len
    }
}

/// In-memory VFS. Records every seek per path so callers can observe what a
/// decoder did to its stream.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    files: Arc<RwLock<HashMap<String, Bytes>>>,
    seeks: Arc<Mutex<HashMap<String, Vec<u64>>>>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        self.files.write().insert(normalize_path(path), data.into());
    }

    /// Remove a file. Streams already open keep their contents.
    pub fn remove(&self, path: &str) {
        self.files.write().remove(&normalize_path(path));
    }

    /// Every seek offset issued on streams of `path`, in order.
    pub fn seeks(&self, path: &str) -> Vec<u64> {
        self.seeks
            .lock()
            .get(&normalize_path(path))
            .cloned()
            .unwrap_or_default()
    }
}

impl Vfs for MemoryVfs {
    fn open(&self, path: &str) -> io::Result<Box<dyn ByteStream>> {
        let path = normalize_path(path);
        let data = self
            .files
            .read()
            .get(&path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.clone()))?;
        Ok(Box::new(MemoryStream {
            data,
            pos: 0,
            path,
            seeks: Arc::clone(&self.seeks),
        }))
    }

    fn size(&self, path: &str) -> io::Result<u64> {
        let path = normalize_path(path);
        self.files
            .read()
            .get(&path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path))
    }
}

struct MemoryStream {
    data: Bytes,
    pos: u64,
    path: String,
    seeks: Arc<Mutex<HashMap<String, Vec<u64>>>>,
}

impl ByteStream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.data.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        trace!("memory stream {}: seek to {offset}", self.path);
        self.seeks
            .lock()
            .entry(self.path.clone())
            .or_default()
            .push(offset);
        self.pos = offset;
        Ok(())
    }

    fn tell(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }

    fn eof(&mut self) -> bool {
        self.pos >= self.data.len() as u64
    }
}
