use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::file::BufferedFile;
use crate::lru::Cache;
use crate::record::{parse_record_at, Record};
use crate::util;

/// The single segment open for append, holding the tail of the log.
pub struct ActiveFile {
    file: BufferedFile,
    pub id: u64,
}

impl ActiveFile {
    /// Opens the active segment for the given id, creating it if missing
    /// and appending after any existing contents.
    pub fn create(dir: &Path, id: u64, buffer_size: usize) -> Result<Self> {
        let file = BufferedFile::create(&util::data_file_path(dir, id), buffer_size)?;
        Ok(Self { file, id })
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Appends an encoded record, returning the offset it was written at.
    pub fn append(&mut self, record: &Record) -> Result<u64> {
        let offset = self.file.size();
        self.file.write(&record.encode())?;
        Ok(offset)
    }

    /// Parses the record starting at the given offset, spanning the write
    /// buffer if necessary.
    pub fn parse_record_at(&self, offset: u64) -> Result<Record> {
        parse_record_at(&self.file, offset)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }
}

/// A read-only view over one segment, sealed or active. Sealed segments
/// are immutable, so a handle can be shared freely between readers.
pub struct DataFile {
    file: BufferedFile,
    pub id: u64,
}

impl DataFile {
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        Ok(Self { file: BufferedFile::open(path)?, id })
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn parse_record_at(&self, offset: u64) -> Result<Record> {
        parse_record_at(&self.file, offset)
    }

    /// Invokes the visitor with every record and its starting offset, in
    /// log order, until clean end of data. Any other parse error, or an
    /// error returned by the visitor, aborts the iteration.
    pub fn for_each_record(
        &self,
        mut visit: impl FnMut(&Record, u64) -> Result<()>,
    ) -> Result<()> {
        let mut offset = 0;
        loop {
            match self.parse_record_at(offset) {
                Ok(record) => {
                    visit(&record, offset)?;
                    offset += record.size();
                }
                Err(Error::EndOfData) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }
}

/// A pinned LRU over open segment handles, keyed by segment id and bounded
/// by the max-open-files option. Eviction drops the handle, closing the
/// underlying file.
pub struct SegmentCache {
    cache: Cache<u64, Arc<DataFile>>,
}

impl SegmentCache {
    pub fn new(capacity: usize) -> Self {
        let on_evict = Box::new(|id: &u64, _: Arc<DataFile>| {
            log::debug!("closing data file {id}");
        });
        Self { cache: Cache::new(capacity, Some(on_evict)) }
    }

    /// Returns a pinned handle for the segment, opening it on demand. The
    /// caller must unpin it when done.
    pub fn pin(&mut self, path: &Path, id: u64) -> Result<Arc<DataFile>> {
        if let Some(file) = self.cache.pin(&id) {
            return Ok(file);
        }
        let file = Arc::new(DataFile::open(path, id)?);
        self.cache.put(id, file.clone());
        self.cache.pin(&id);
        Ok(file)
    }

    pub fn unpin(&mut self, id: u64) {
        self.cache.unpin(&id);
    }

    /// Drops a segment's handle regardless of pins, e.g. after compaction
    /// deleted the file.
    pub fn remove(&mut self, id: u64) {
        self.cache.remove(&id);
    }

    pub fn close(&mut self) {
        self.cache.close();
    }
}
