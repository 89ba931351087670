//! Adapter exposing a VFS byte stream to symphonia.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use carillon_core::ByteStream;
use parking_lot::Mutex;
use symphonia::core::io::MediaSource;

/// A byte stream shared between a sound and whichever codec is reading it.
pub type SharedStream = Arc<Mutex<Box<dyn ByteStream>>>;

/// `Read + Seek` view over a [`SharedStream`].
pub struct StreamSource {
    stream: SharedStream,
    len: Option<u64>,
}

impl StreamSource {
    pub fn new(stream: SharedStream, len: Option<u64>) -> Self {
        Self { stream, len }
    }
}

impl Read for StreamSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.lock().read(buf)
    }
}

impl Seek for StreamSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut stream = self.stream.lock();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => stream.tell()?.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let len = self.len.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "stream length unknown")
                })?;
                len.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        stream.seek(target)?;
        Ok(target)
    }
}

impl MediaSource for StreamSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carillon_core::{MemoryVfs, Vfs};

    #[test]
    fn test_relative_seeks_resolve_against_tell() {
        let vfs = MemoryVfs::new();
        vfs.insert("a.bin", (0u8..32).collect::<Vec<_>>());
        let stream: SharedStream = Arc::new(Mutex::new(vfs.open("a.bin").unwrap()));
        let mut source = StreamSource::new(stream, Some(32));

        assert_eq!(source.seek(SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(source.seek(SeekFrom::Current(2)).unwrap(), 6);
        let mut byte = [0u8; 1];
        source.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 6);
        assert_eq!(source.seek(SeekFrom::End(-1)).unwrap(), 31);
        assert!(source.seek(SeekFrom::Current(-100)).is_err());
    }
}
