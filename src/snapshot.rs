use crate::bitcask::BitCask;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::segment::DataFile;
use crate::util;

/// A point-in-time view of the log, bounded by the active segment's
/// position at creation time. Records appended after the snapshot was
/// taken are invisible to its iterators.
pub struct Snapshot {
    store: BitCask,
    /// Monotone id assigned at creation.
    pub snap_id: u64,
    active_file_id: u64,
    active_size: u64,
    min_file_id: u64,
}

impl BitCask {
    /// Captures a snapshot of the current log position.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut state = self.state()?;
        // Flush so the captured prefix is readable from the data files.
        state.active.flush()?;
        let snapshot = Snapshot {
            store: self.clone(),
            snap_id: state.version,
            active_file_id: state.active.id,
            active_size: state.active.size(),
            min_file_id: state.min_file_id,
        };
        state.version += 1;
        Ok(snapshot)
    }
}

impl Snapshot {
    /// Iterates over every record within the snapshot bounds in log order:
    /// ascending segment id, then file offset. Merge markers are skipped;
    /// tombstones are yielded so callers can observe deletions. The
    /// iterator borrows the snapshot, so the snapshot cannot be released
    /// while an iterator remains.
    pub fn iter(&self) -> SnapshotIter<'_> {
        SnapshotIter { snapshot: self, file: None, offset: 0, started: false, done: false }
    }
}

/// A forward scan over a snapshot. Opens its own read handles, bypassing
/// the segment cache, so a long scan cannot pin cache capacity.
pub struct SnapshotIter<'a> {
    snapshot: &'a Snapshot,
    file: Option<DataFile>,
    offset: u64,
    started: bool,
    done: bool,
}

impl SnapshotIter<'_> {
    /// Opens the next existing data file after `after`, or the first one
    /// at or above the snapshot's minimum id, within the snapshot bounds.
    fn open_next(&self, after: Option<u64>) -> Result<Option<DataFile>> {
        let mut id = match after {
            Some(id) => id + 1,
            None => self.snapshot.min_file_id,
        };
        while id <= self.snapshot.active_file_id {
            let path = util::data_file_path(&self.snapshot.store.shared.dir, id);
            if path.exists() {
                return Ok(Some(DataFile::open(&path, id)?));
            }
            id += 1;
        }
        Ok(None)
    }

    fn step(&mut self) -> Result<Option<Record>> {
        if !self.started {
            self.started = true;
            self.file = self.open_next(None)?;
        }
        loop {
            let (file_id, parsed) = match &self.file {
                None => return Ok(None),
                Some(file) => {
                    if file.id == self.snapshot.active_file_id
                        && self.offset >= self.snapshot.active_size
                    {
                        return Ok(None);
                    }
                    (file.id, file.parse_record_at(self.offset))
                }
            };
            match parsed {
                Ok(record) => {
                    self.offset += record.size();
                    if record.is_merge_marker() {
                        continue;
                    }
                    return Ok(Some(record));
                }
                Err(Error::EndOfData) => {
                    if file_id >= self.snapshot.active_file_id {
                        return Ok(None);
                    }
                    self.file = self.open_next(Some(file_id))?;
                    self.offset = 0;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Iterator for SnapshotIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
