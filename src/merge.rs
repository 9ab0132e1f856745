use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::bitcask::BitCask;
use crate::error::Result;
use crate::record::Record;
use crate::util;

impl BitCask {
    /// Runs one compaction pass over all sealed segments, rewriting
    /// still-live records into the active tail and deleting the sources.
    /// A no-op if a merge is already running.
    ///
    /// The engine lock is taken per record copied, not for the whole pass,
    /// so foreground traffic keeps making progress. Each record's liveness
    /// is re-checked under the lock at copy time, which makes concurrent
    /// overwrites safe: a superseded record simply fails the check and is
    /// skipped.
    pub fn merge(&self) -> Result<()> {
        if self
            .shared
            .is_merging
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::info!("A merge is already running");
            return Ok(());
        }
        let result = self.run_merge();
        self.shared.is_merging.store(false, Ordering::SeqCst);
        result
    }

    fn run_merge(&self) -> Result<()> {
        let start = Instant::now();
        let (mut next, end) = {
            let state = self.state()?;
            (Some(state.min_file_id).filter(|&id| id < state.active.id), state.active.id)
        };
        log::info!("Starting merge of segments below {end}");
        let mut merged = 0;
        while let Some(id) = next {
            if id >= end {
                break;
            }
            self.merge_data_file(id)?;
            merged += 1;
            next = {
                let state = self.state()?;
                self.next_data_file_id(&state, id)
            };
        }
        log::info!("Merged {merged} segments in {:.3}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Rewrites one sealed segment's live records into the active tail,
    /// then deletes its data and hint files and logs a merge marker so an
    /// external replication log can reproduce the deletion.
    fn merge_data_file(&self, file_id: u64) -> Result<()> {
        let start = Instant::now();
        let segment = {
            let mut state = self.state()?;
            let path = util::data_file_path(&self.shared.dir, file_id);
            state.segment_cache.pin(&path, file_id)?
        };

        let now = util::unix_now();
        let result = segment.for_each_record(|record, offset| {
            if record.is_merge_marker() {
                return Ok(());
            }
            let mut state = self.state()?;
            // Copy only if this record is still the key's latest version
            // and has not expired.
            let live = matches!(
                state.keydir.get(&record.key),
                Some(item) if item.file_id == file_id && item.record_offset() == offset
            );
            if !live || (record.expiration != 0 && record.expiration <= now) {
                return Ok(());
            }
            self.add_record(&mut state, record.clone())
        });

        let mut state = self.state()?;
        state.segment_cache.unpin(file_id);
        result?;
        self.remove_data_file(&mut state, file_id)?;
        self.add_record(&mut state, Record::merge_marker(file_id))?;
        drop(state);

        log::info!("Merged segment {file_id} in {:.3}s", start.elapsed().as_secs_f64());
        Ok(())
    }
}
