use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// An append-only file with an internal write buffer and positioned reads
/// that transparently span the flushed region and the pending buffer.
///
/// Writes are strictly appending: buffered bytes always follow the last
/// on-disk byte, so a read at any offset below `size()` can be served from
/// the disk region, the buffer, or both. The buffer is not concurrency-safe
/// on its own; callers serialize access externally.
#[derive(Debug)]
pub struct BufferedFile {
    path: PathBuf,
    file: File,
    /// Total bytes accepted, flushed plus buffered.
    size: u64,
    /// Pending bytes not yet written to disk. Never exceeds `capacity`.
    wbuf: Vec<u8>,
    capacity: usize,
}

impl BufferedFile {
    /// Opens a file for appending, creating it if missing. The append
    /// position is the current end of the file. A capacity of 0 disables
    /// buffering and writes straight to disk.
    pub fn create(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            wbuf: Vec::with_capacity(capacity),
            capacity,
        })
    }

    /// Opens an existing file read-only. Reads behave as with `create`, but
    /// the buffer is unused and writes must not be issued.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { path: path.to_path_buf(), file, size, wbuf: Vec::new(), capacity: 0 })
    }

    /// The path this file was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes written, whether or not they have reached disk.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes on disk, i.e. everything below the buffered suffix.
    fn flushed(&self) -> u64 {
        self.size - self.wbuf.len() as u64
    }

    /// Appends bytes. While the payload exceeds the buffer's remaining
    /// room, either write it directly to disk (buffer empty) or top up the
    /// buffer and flush; any trailing bytes are left in the buffer.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while data.len() > self.capacity - self.wbuf.len() {
            if self.wbuf.is_empty() {
                self.file.write_all_at(data, self.size)?;
                self.size += data.len() as u64;
                return Ok(());
            }
            let room = self.capacity - self.wbuf.len();
            self.wbuf.extend_from_slice(&data[..room]);
            self.size += room as u64;
            data = &data[room..];
            self.flush()?;
        }
        self.wbuf.extend_from_slice(data);
        self.size += data.len() as u64;
        Ok(())
    }

    /// Reads up to `len` bytes at `offset`, first from disk and then from
    /// the pending buffer. Returns fewer bytes (possibly none) when the
    /// requested range extends past the end of data, like `Read::read`.
    pub fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let flushed = self.flushed();
        let mut data = Vec::new();
        if offset < flushed {
            data.resize(len.min(flushed - offset) as usize, 0);
            self.file.read_exact_at(&mut data, offset)?;
        }
        if (data.len() as u64) < len {
            let start = (offset + data.len() as u64 - flushed) as usize;
            if start < self.wbuf.len() {
                let n = (len as usize - data.len()).min(self.wbuf.len() - start);
                data.extend_from_slice(&self.wbuf[start..start + n]);
            }
        }
        Ok(data)
    }

    /// Writes any buffered bytes to disk. Idempotent; on failure the buffer
    /// is kept intact for the next attempt.
    pub fn flush(&mut self) -> Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let offset = self.flushed();
        self.file.write_all_at(&self.wbuf, offset)?;
        self.wbuf.clear();
        Ok(())
    }

    /// Flushes and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
