//! Shared file handles with scoped-lock access.
//!
//! A partial file's descriptor may be shared between a store and ad-hoc
//! readers, so every positioned read or write takes a short-lived exclusive
//! critical section around the seek plus the transfer. Local file I/O is
//! expected to be fast; callers perform it inline.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;

/// File handle usable from multiple owners, one positioned operation at a
/// time.
#[derive(Debug)]
pub struct SharedFile {
    inner: Mutex<File>,
}

impl SharedFile {
    /// Opens (creating if absent) a file for positioned reads and writes.
    pub fn open_read_write(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            inner: Mutex::new(file),
        })
    }

    /// Opens an existing file for positioned reads only.
    pub fn open_read(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            inner: Mutex::new(file),
        })
    }

    /// Writes `data` at `offset`, growing the file if needed.
    pub fn write_at(&self, offset: i64, data: &[u8]) -> io::Result<()> {
        let mut file = self.inner.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)
    }

    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// A short read is an error: the caller asked for bytes the range map
    /// claims are present, so anything less means local corruption.
    pub fn read_at(&self, offset: i64, len: usize) -> io::Result<Bytes> {
        let mut buffer = vec![0u8; len];
        {
            let mut file = self.inner.lock();
            file.seek(SeekFrom::Start(offset as u64))?;
            file.read_exact(&mut buffer)?;
        }
        Ok(Bytes::from(buffer))
    }

    /// Current length of the file in bytes.
    pub fn len(&self) -> io::Result<u64> {
        self.inner.lock().metadata().map(|meta| meta.len())
    }

    /// Whether the file is currently empty.
    pub fn is_empty(&self) -> io::Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Flushes file contents and metadata to durable storage.
    pub fn sync_all(&self) -> io::Result<()> {
        self.inner.lock().sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.partial");
        let file = SharedFile::open_read_write(&path).unwrap();

        file.write_at(100, b"hello").unwrap();
        let data = file.read_at(100, 5).unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(file.len().unwrap(), 105);
    }

    #[test]
    fn test_sparse_write_leaves_hole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.partial");
        let file = SharedFile::open_read_write(&path).unwrap();

        file.write_at(10, b"xy").unwrap();
        let hole = file.read_at(0, 10).unwrap();
        assert_eq!(&hole[..], &[0u8; 10]);
    }

    #[test]
    fn test_short_read_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.partial");
        let file = SharedFile::open_read_write(&path).unwrap();

        file.write_at(0, b"abc").unwrap();
        assert!(file.read_at(0, 10).is_err());
    }

    #[test]
    fn test_open_read_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SharedFile::open_read(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_overwrite_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.partial");
        let file = SharedFile::open_read_write(&path).unwrap();

        file.write_at(0, b"aaaaaaaa").unwrap();
        file.write_at(2, b"bbb").unwrap();
        let data = file.read_at(0, 8).unwrap();
        assert_eq!(&data[..], b"aabbbaaa");
    }
}
