use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use fs4::fs_std::FileExt;
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};

use crate::errcorrupt;
use crate::errinput;
use crate::error::Result;
use crate::hint::HintFile;
use crate::keydir::{DirItem, KeyDir};
use crate::options::Options;
use crate::record::{Record, RecordCache, RECORD_HEADER_SIZE};
use crate::segment::{ActiveFile, DataFile, SegmentCache};
use crate::util;

/// A BitCask-style log-structured key-value store. See:
/// https://riak.com/assets/bitcask-intro.pdf
///
/// Writes append records to the active segment of an on-disk log and track
/// the latest record of every key in an in-memory keydir. When the active
/// segment reaches the configured size it is sealed together with a hint
/// file (a compact side-index over its keys) and a new segment is opened;
/// reopening the store rebuilds the keydir from the hint files where
/// present and by scanning records where not. Old garbage is reclaimed by
/// `merge`, which rewrites still-live records from sealed segments into the
/// active tail and deletes the source segments.
///
/// The handle is cheap to clone and can be shared across threads. All
/// state sits behind a single reader-writer lock which every operation,
/// reads included, takes in write mode: reads mutate cache refcounts and
/// LRU recency, so only mutual exclusion is required for correctness.
/// Compaction takes the lock per record copied rather than for its whole
/// pass, re-checking each record's liveness under the lock.
#[derive(Clone)]
pub struct BitCask {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) dir: PathBuf,
    pub(crate) opts: Options,
    /// Exclusive lock on the database directory, preventing concurrent
    /// engines. Replaced when the directory itself is recreated.
    dir_lock: Mutex<File>,
    /// Set while a merge pass runs; compare-and-swapped outside the state
    /// lock.
    pub(crate) is_merging: AtomicBool,
    pub(crate) state: RwLock<State>,
}

/// All mutable engine state, guarded by the engine lock.
pub(crate) struct State {
    pub(crate) active: ActiveFile,
    /// Maps every key to its most recent record across all segments.
    pub(crate) keydir: KeyDir,
    /// Maps only the active segment's keys, feeding the hint file when the
    /// segment is sealed.
    pub(crate) active_keydir: KeyDir,
    /// The lowest segment id present on disk.
    pub(crate) min_file_id: u64,
    pub(crate) record_cache: RecordCache,
    pub(crate) segment_cache: SegmentCache,
    /// Monotone snapshot counter.
    pub(crate) version: u64,
}

/// The identity and content digest of a sealed segment, for replicators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: u64,
    pub md5: [u8; 16],
}

impl BitCask {
    /// Opens or creates a store in the given directory, restoring the
    /// keydir from the segments found there.
    pub fn open(dir: impl Into<PathBuf>, opts: Options) -> Result<BitCask> {
        let dir = dir.into();
        log::info!("Opening database {}", dir.display());
        fs::create_dir_all(&dir)?;
        let dir_lock = lock_dir(&dir)?;
        let state = State::restore(&dir, &opts)?;
        log::info!(
            "Indexed {} keys in {} segments in {}",
            state.keydir.len(),
            state.active.id - state.min_file_id + 1,
            dir.display()
        );
        Ok(BitCask {
            shared: Arc::new(Shared {
                dir,
                opts,
                dir_lock: Mutex::new(dir_lock),
                is_merging: AtomicBool::new(false),
                state: RwLock::new(state),
            }),
        })
    }

    /// Takes the engine lock. Readers take it in write mode too, since
    /// they mutate cache state.
    pub(crate) fn state(&self) -> Result<RwLockWriteGuard<'_, State>> {
        Ok(self.shared.state.write()?)
    }

    /// Sets a key to a value, replacing any prior value.
    pub fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.set_with_expiration(key, value, 0)
    }

    /// Sets a key to a value that expires at the given time, in seconds
    /// since the Unix epoch. 0 never expires.
    pub fn set_with_expiration(&self, key: &[u8], value: Vec<u8>, expiration: u32) -> Result<()> {
        let record = Record::put(key.to_vec(), value, expiration);
        let mut state = self.state()?;
        self.add_record(&mut state, record)
    }

    /// Deletes a key by appending a tombstone record.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        let record = Record::tombstone(key.to_vec());
        let mut state = self.state()?;
        self.add_record(&mut state, record)
    }

    /// Gets a value for a key, or None if the key is absent, deleted, or
    /// expired.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.state()?;
        let item = match state.keydir.get(key) {
            Some(item) => *item,
            None => return Ok(None),
        };
        if item.is_deleted() || item.is_expired(util::unix_now()) {
            return Ok(None);
        }
        let record = self.ref_record(&mut state, item.file_id, item.record_offset())?;
        let value = record.value.clone();
        state.record_cache.unpin(item.file_id, item.record_offset());
        Ok(Some(value))
    }

    /// Returns every live, unexpired key, in no particular order.
    pub fn list_keys(&self) -> Result<Vec<Vec<u8>>> {
        let state = self.state()?;
        let now = util::unix_now();
        Ok(state
            .keydir
            .iter()
            .filter(|(_, item)| !item.is_deleted() && !item.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// Flushes and fsyncs the active segment.
    pub fn sync(&self) -> Result<()> {
        self.state()?.active.sync()
    }

    /// Flushes the active segment and force-evicts both caches, running
    /// their eviction callbacks. Dropping the last handle releases the
    /// files and the directory lock.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state()?;
        state.active.sync()?;
        state.record_cache.close();
        state.segment_cache.close();
        Ok(())
    }

    /// Destroys all data and reinitializes an empty store in the same
    /// directory.
    pub fn clear_all(&self) -> Result<()> {
        let mut state = self.state()?;
        state.record_cache.close();
        state.segment_cache.close();
        let dir = &self.shared.dir;
        // Open handles keep the unlinked files alive until the state is
        // replaced below.
        fs::remove_dir_all(dir)?;
        fs::create_dir_all(dir)?;
        *self.shared.dir_lock.lock()? = lock_dir(dir)?;
        *state = State::restore(dir, &self.shared.opts)?;
        log::info!("Cleared database {}", dir.display());
        Ok(())
    }

    /// Discards every segment with id >= upper_file_id, then restores the
    /// store from the remaining prefix of the log.
    pub fn truncate(&self, upper_file_id: u64) -> Result<()> {
        let mut state = self.state()?;
        state.active.sync()?;
        state.record_cache.close();
        state.segment_cache.close();
        let dir = &self.shared.dir;
        for id in list_data_file_ids(dir)?.into_iter().filter(|&id| id >= upper_file_id) {
            remove_segment_files(dir, id)?;
        }
        *state = State::restore(dir, &self.shared.opts)?;
        log::info!("Truncated database {} below segment {upper_file_id}", dir.display());
        Ok(())
    }

    /// Applies an externally supplied encoded record, the entry point for
    /// a replication log. The target must be the current active segment at
    /// exactly the current append position, or the next segment id, in
    /// which case the active segment is first rotated. A merge marker
    /// additionally removes the segment it names.
    pub fn sync_file(&self, file_id: u64, offset: u64, data: &[u8]) -> Result<()> {
        let record = Record::decode(data)?;
        if record.size() != data.len() as u64 {
            return Err(errinput!(
                "sync data of {} bytes does not hold exactly one record",
                data.len()
            ));
        }
        let mut state = self.state()?;
        if file_id == state.active.id + 1 {
            self.rotate(&mut state)?;
        } else if file_id != state.active.id {
            return Err(errinput!(
                "sync file id {file_id} does not match active segment {}",
                state.active.id
            ));
        }
        if offset != state.active.size() {
            return Err(errinput!(
                "sync offset {offset} does not match active segment size {}",
                state.active.size()
            ));
        }
        if record.is_merge_marker() {
            let target = record.merge_target();
            if target >= state.active.id {
                return Err(errinput!("merge marker names unsealed segment {target}"));
            }
            self.remove_data_file(&mut state, target)?;
        }
        self.add_record(&mut state, record)
    }

    /// Returns the id and data-segment MD5 digest of every sealed segment,
    /// preferring the digest recorded at sealing time in the hint file.
    pub fn file_metas(&self) -> Result<Vec<FileMeta>> {
        let state = self.state()?;
        let dir = &self.shared.dir;
        let mut metas = Vec::new();
        for id in list_data_file_ids(dir)? {
            if id >= state.active.id {
                continue;
            }
            let hint_path = util::hint_file_path(dir, id);
            let md5 = if hint_path.exists() {
                HintFile::open(&hint_path)?.digest()
            } else {
                util::file_md5(&util::data_file_path(dir, id))?
            };
            metas.push(FileMeta { file_id: id, md5 });
        }
        Ok(metas)
    }

    /// Appends a record to the active segment and updates both keydirs,
    /// rotating the segment once it reaches the size threshold. The shared
    /// write path for sets, deletes, compaction copies, merge markers and
    /// sync-file applications.
    pub(crate) fn add_record(&self, state: &mut State, record: Record) -> Result<()> {
        let offset = state.active.append(&record)?;
        if !record.is_merge_marker() {
            let item = DirItem {
                flag: record.flag,
                file_id: state.active.id,
                value_pos: offset + RECORD_HEADER_SIZE,
                value_size: record.value.len() as u64,
                expiration: record.expiration,
            };
            // Replace unless the existing entry is newer.
            let newer_exists = state
                .keydir
                .get(&record.key)
                .is_some_and(|existing| existing.file_id > item.file_id);
            if !newer_exists {
                state.keydir.put(record.key.clone(), item);
            }
            state.active_keydir.put(record.key, item);
        }
        if state.active.size() >= self.shared.opts.max_file_size {
            self.rotate(state)?;
        }
        Ok(())
    }

    /// Seals the active segment: syncs it, emits its hint file carrying
    /// the segment's MD5 digest, and opens a fresh active segment at the
    /// next id.
    fn rotate(&self, state: &mut State) -> Result<()> {
        state.active.sync()?;
        let sealed_id = state.active.id;
        let dir = &self.shared.dir;
        let digest = util::file_md5(&util::data_file_path(dir, sealed_id))?;
        let mut hint = HintFile::create(
            &util::hint_file_path(dir, sealed_id),
            sealed_id,
            digest,
            self.shared.opts.buffer_size,
        )?;
        for (key, item) in state.active_keydir.iter() {
            hint.add(key, item)?;
        }
        hint.sync()?;
        state.active_keydir.clear();
        state.active = ActiveFile::create(dir, sealed_id + 1, self.shared.opts.buffer_size)?;
        log::debug!("Sealed segment {sealed_id}, active segment is now {}", sealed_id + 1);
        Ok(())
    }

    /// Returns a pinned parsed record, loading it through the caches on a
    /// miss. A record in a sealed segment pins the segment handle through
    /// the segment cache for the duration of the parse. Callers unpin the
    /// record once they have copied the value out.
    pub(crate) fn ref_record(
        &self,
        state: &mut State,
        file_id: u64,
        offset: u64,
    ) -> Result<Arc<Record>> {
        if let Some(record) = state.record_cache.pin(file_id, offset) {
            return Ok(record);
        }
        let record = if file_id == state.active.id {
            state.active.parse_record_at(offset)?
        } else {
            let path = util::data_file_path(&self.shared.dir, file_id);
            let segment = state.segment_cache.pin(&path, file_id)?;
            let result = segment.parse_record_at(offset);
            state.segment_cache.unpin(file_id);
            result?
        };
        Ok(state.record_cache.insert(file_id, offset, Arc::new(record)))
    }

    /// Removes a dead segment's data and hint files and purges both caches
    /// of its id, advancing the minimum segment id past it if needed.
    pub(crate) fn remove_data_file(&self, state: &mut State, file_id: u64) -> Result<()> {
        remove_segment_files(&self.shared.dir, file_id)?;
        state.segment_cache.remove(file_id);
        state.record_cache.remove_file(file_id);
        if state.min_file_id == file_id {
            state.min_file_id = self.next_data_file_id(state, file_id).unwrap_or(state.active.id);
        }
        Ok(())
    }

    /// The next id after `after` whose data file exists on disk, up to and
    /// including the active segment.
    pub(crate) fn next_data_file_id(&self, state: &State, after: u64) -> Option<u64> {
        (after + 1..=state.active.id)
            .find(|&id| util::data_file_path(&self.shared.dir, id).exists())
    }
}

/// Flush the active segment when the last handle is dropped.
impl Drop for Shared {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let Err(err) = state.active.sync() {
                log::error!("failed to flush active segment: {err}");
            }
        }
    }
}

impl State {
    /// Rebuilds engine state from the segments in a directory. Sealed
    /// segments restore from their hint file when one exists and by
    /// scanning records otherwise, in ascending id order. A segment that
    /// fails to restore is removed from disk along with every higher id,
    /// truncating the store to its last intact prefix.
    fn restore(dir: &Path, opts: &Options) -> Result<State> {
        let ids = list_data_file_ids(dir)?;

        let mut keydir = KeyDir::new();
        let mut active_keydir = KeyDir::new();
        let mut restored: Vec<u64> = Vec::new();
        for (i, &id) in ids.iter().enumerate() {
            match Self::restore_segment(dir, id) {
                Ok(contribution) => {
                    for (key, item) in contribution.iter() {
                        // Replace unless the existing entry is newer.
                        let newer_exists =
                            keydir.get(key).is_some_and(|existing| existing.file_id > item.file_id);
                        if !newer_exists {
                            keydir.put(key.clone(), *item);
                        }
                    }
                    active_keydir = contribution;
                    restored.push(id);
                }
                Err(err) => {
                    log::error!(
                        "Restoring segment {id} failed ({err}), removing it and all later segments"
                    );
                    for &corrupt in &ids[i..] {
                        remove_segment_files(dir, corrupt)?;
                    }
                    break;
                }
            }
        }

        // Reopen the highest surviving segment for append, unless it was
        // already sealed with a hint file; appending behind a hint would
        // leave the hint stale, so a fresh segment is opened instead.
        let (min_file_id, active_id) = match (restored.first(), restored.last()) {
            (Some(&min), Some(&max)) if util::hint_file_path(dir, max).exists() => {
                active_keydir.clear();
                (min, max + 1)
            }
            (Some(&min), Some(&max)) => (min, max),
            _ => (0, 0),
        };

        let active = ActiveFile::create(dir, active_id, opts.buffer_size)?;
        Ok(State {
            active,
            keydir,
            active_keydir,
            min_file_id,
            record_cache: RecordCache::new(opts.cache_size),
            segment_cache: SegmentCache::new(opts.max_open_files),
            version: 0,
        })
    }

    /// Restores one segment's keydir contribution.
    fn restore_segment(dir: &Path, id: u64) -> Result<KeyDir> {
        let hint_path = util::hint_file_path(dir, id);
        if hint_path.exists() {
            Self::restore_from_hint(&hint_path, id)
        } else {
            Self::restore_from_data(&util::data_file_path(dir, id), id)
        }
    }

    fn restore_from_hint(path: &Path, id: u64) -> Result<KeyDir> {
        let hint = HintFile::open(path)?;
        if hint.id != id {
            return Err(errcorrupt!("hint file {} names segment {}", path.display(), hint.id));
        }
        let mut keydir = KeyDir::new();
        hint.for_each_item(|item| {
            keydir.put(item.key.clone(), item.to_dir_item(id));
            Ok(())
        })?;
        Ok(keydir)
    }

    fn restore_from_data(path: &Path, id: u64) -> Result<KeyDir> {
        let file = DataFile::open(path, id)?;
        let mut keydir = KeyDir::new();
        file.for_each_record(|record, offset| {
            if record.is_merge_marker() {
                return Ok(());
            }
            keydir.put(
                record.key.clone(),
                DirItem {
                    flag: record.flag,
                    file_id: id,
                    value_pos: offset + RECORD_HEADER_SIZE,
                    value_size: record.value.len() as u64,
                    expiration: record.expiration,
                },
            );
            Ok(())
        })?;
        Ok(keydir)
    }
}

/// Takes out an exclusive lock on the database directory, erroring if it
/// is already held by another engine.
fn lock_dir(dir: &Path) -> Result<File> {
    let file = File::open(dir)?;
    file.try_lock_exclusive()?;
    Ok(file)
}

/// Lists the segment ids of all data files in a directory, in ascending
/// order. Non-segment file names are ignored.
pub(crate) fn list_data_file_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(id) = util::id_from_data_file_name(name) {
                ids.push(id);
            }
        }
    }
    Ok(ids.into_iter().sorted().collect())
}

/// Removes a segment's data and hint files, tolerating a missing hint.
pub(crate) fn remove_segment_files(dir: &Path, id: u64) -> Result<()> {
    for path in [util::data_file_path(dir, id), util::hint_file_path(dir, id)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::os::unix::fs::FileExt as _;

    fn setup() -> Result<(tempfile::TempDir, BitCask)> {
        setup_with(Options::default())
    }

    fn setup_with(opts: Options) -> Result<(tempfile::TempDir, BitCask)> {
        let dir = tempfile::TempDir::with_prefix("bitcask")?;
        let store = BitCask::open(dir.path().join("db"), opts)?;
        Ok((dir, store))
    }

    /// Counts the data files in a database directory.
    fn data_file_count(store: &BitCask) -> Result<usize> {
        Ok(list_data_file_ids(&store.shared.dir)?.len())
    }

    #[test]
    fn point_ops() -> Result<()> {
        let (_dir, store) = setup()?;
        store.set(b"key1", b"hello".to_vec())?;
        store.set(b"key2", b"world".to_vec())?;
        store.set(b"key3", b"nihao".to_vec())?;

        assert_eq!(store.get(b"key3")?, Some(b"nihao".to_vec()));
        assert_eq!(store.get(b"key2")?, Some(b"world".to_vec()));
        assert_eq!(store.get(b"key4")?, None);

        store.del(b"key2")?;
        assert_eq!(store.get(b"key2")?, None);
        assert_eq!(store.get(b"key1")?, Some(b"hello".to_vec()));

        // Empty keys and values are valid.
        store.set(b"", Vec::new())?;
        assert_eq!(store.get(b"")?, Some(Vec::new()));

        // Overwrites replace the value.
        store.set(b"key1", b"goodbye".to_vec())?;
        assert_eq!(store.get(b"key1")?, Some(b"goodbye".to_vec()));

        // Deleting a missing key is a no-op for reads.
        store.del(b"missing")?;
        assert_eq!(store.get(b"missing")?, None);
        Ok(())
    }

    /// Tests key/value sizes up to 1 MB.
    #[test]
    fn point_ops_sizes() -> Result<()> {
        let (_dir, store) = setup()?;
        for size in (1..=20).map(|i| 1usize << i) {
            let value = vec![b'x'; size];
            let key = value.as_slice();
            assert_eq!(store.get(key)?, None);
            store.set(key, value.clone())?;
            assert_eq!(store.get(key)?, Some(value.clone()));
            store.del(key)?;
            assert_eq!(store.get(key)?, None);
        }
        Ok(())
    }

    /// A small rotation threshold yields multiple segments, and reads hit
    /// the right one.
    #[test]
    fn rotation() -> Result<()> {
        let opts = Options { max_file_size: 128, ..Options::default() };
        let (_dir, store) = setup_with(opts)?;
        for i in 0..20 {
            let key = format!("k{i:02}");
            store.set(key.as_bytes(), format!("value-{i:02}-xxxxxx").into_bytes())?;
        }
        assert!(data_file_count(&store)? >= 2);
        for i in 0..20 {
            let key = format!("k{i:02}");
            assert_eq!(
                store.get(key.as_bytes())?,
                Some(format!("value-{i:02}-xxxxxx").into_bytes()),
                "key {key}"
            );
        }

        // Every sealed segment has a hint file.
        let state = store.state()?;
        for id in list_data_file_ids(&store.shared.dir)? {
            if id < state.active.id {
                assert!(util::hint_file_path(&store.shared.dir, id).exists(), "hint for {id}");
            }
        }
        Ok(())
    }

    /// Segment ids assigned by rotation strictly increase.
    #[test]
    fn rotation_monotonic() -> Result<()> {
        let opts = Options { max_file_size: 1, ..Options::default() };
        let (_dir, store) = setup_with(opts)?;
        let mut last = store.state()?.active.id;
        for i in 0..5 {
            store.set(format!("k{i}").as_bytes(), b"v".to_vec())?;
            let id = store.state()?.active.id;
            assert!(id > last);
            last = id;
        }
        Ok(())
    }

    /// Closing and reopening the store preserves every key's value.
    #[test]
    fn reopen() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("bitcask")?;
        let path = dir.path().join("db");
        let store = BitCask::open(path.clone(), Options::default())?;
        store.set(b"a", b"1".to_vec())?;
        store.set(b"b", b"2".to_vec())?;
        store.set(b"a", b"3".to_vec())?;
        store.del(b"c")?;
        store.close()?;
        drop(store);

        let store = BitCask::open(path, Options::default())?;
        assert_eq!(store.get(b"a")?, Some(b"3".to_vec()));
        assert_eq!(store.get(b"b")?, Some(b"2".to_vec()));
        assert_eq!(store.get(b"c")?, None);
        Ok(())
    }

    /// Tombstones survive a reopen, and a later write resurrects the key.
    #[test]
    fn reopen_tombstone() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("bitcask")?;
        let path = dir.path().join("db");
        let store = BitCask::open(path.clone(), Options::default())?;
        store.set(b"a", b"1".to_vec())?;
        store.del(b"a")?;
        drop(store);

        let store = BitCask::open(path.clone(), Options::default())?;
        assert_eq!(store.get(b"a")?, None);
        store.set(b"a", b"2".to_vec())?;
        drop(store);

        let store = BitCask::open(path, Options::default())?;
        assert_eq!(store.get(b"a")?, Some(b"2".to_vec()));
        Ok(())
    }

    /// Restoring from hint files and from full segment scans yields the
    /// same keydir.
    #[test]
    fn hint_equivalence() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("bitcask")?;
        let path = dir.path().join("db");
        let opts = Options { max_file_size: 128, ..Options::default() };
        let store = BitCask::open(path.clone(), opts.clone())?;
        for i in 0..20 {
            store.set(format!("k{i:02}").as_bytes(), format!("value-{i:02}").into_bytes())?;
        }
        store.del(b"k03")?;
        drop(store);

        // First reopen restores via hint files.
        let store = BitCask::open(path.clone(), opts.clone())?;
        let mut expect: Vec<_> = (0..20)
            .filter(|&i| i != 3)
            .map(|i| (format!("k{i:02}").into_bytes(), format!("value-{i:02}").into_bytes()))
            .collect();
        expect.sort();
        let mut keys = store.list_keys()?;
        keys.sort();
        assert_eq!(keys, expect.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>());
        drop(store);

        // Remove the hints and reopen again: a full scan must agree.
        for id in list_data_file_ids(&path)? {
            let hint = util::hint_file_path(&path, id);
            if hint.exists() {
                fs::remove_file(hint)?;
            }
        }
        let store = BitCask::open(path, opts)?;
        for (key, value) in expect {
            assert_eq!(store.get(&key)?, Some(value));
        }
        assert_eq!(store.get(b"k03")?, None);
        Ok(())
    }

    /// A corrupted tail segment is discarded on reopen, keeping all keys
    /// whose latest write lives in earlier segments.
    #[test]
    fn crash_truncation() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("bitcask")?;
        let path = dir.path().join("db");
        // Three ~27-byte records fill a 60-byte segment and rotate it.
        let opts = Options { max_file_size: 60, buffer_size: 0, ..Options::default() };
        let store = BitCask::open(path.clone(), opts.clone())?;
        store.set(b"a", b"1".to_vec())?;
        store.set(b"b", b"2".to_vec())?;
        store.set(b"c", b"3".to_vec())?; // rotates segment 0
        store.set(b"d", b"4".to_vec())?; // lands in segment 1
        let damaged = store.state()?.active.id;
        assert_eq!(damaged, 1);
        drop(store);

        // Corrupt the last 4 bytes of the highest-id segment.
        let data_path = util::data_file_path(&path, damaged);
        let file = fs::OpenOptions::new().write(true).open(&data_path)?;
        let len = file.metadata()?.len();
        file.write_all_at(&[0xff; 4], len - 4)?;
        drop(file);

        let store = BitCask::open(path.clone(), opts)?;
        assert_eq!(store.get(b"a")?, Some(b"1".to_vec()));
        assert_eq!(store.get(b"b")?, Some(b"2".to_vec()));
        assert_eq!(store.get(b"c")?, Some(b"3".to_vec()));
        assert_eq!(store.get(b"d")?, None);
        Ok(())
    }

    /// Exclusive directory locks prevent concurrent engines, and are
    /// released when the store is dropped.
    #[test]
    fn lock() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("bitcask")?;
        let path = dir.path().join("db");
        let store = BitCask::open(path.clone(), Options::default())?;
        assert!(BitCask::open(path.clone(), Options::default()).is_err());
        drop(store);
        assert!(BitCask::open(path, Options::default()).is_ok());
        Ok(())
    }

    #[test]
    fn clear_all() -> Result<()> {
        let opts = Options { max_file_size: 128, ..Options::default() };
        let (_dir, store) = setup_with(opts)?;
        for i in 0..20 {
            store.set(format!("k{i:02}").as_bytes(), vec![b'v'; 16])?;
        }
        store.clear_all()?;
        assert_eq!(store.get(b"k00")?, None);
        assert!(store.list_keys()?.is_empty());
        assert_eq!(data_file_count(&store)?, 1); // fresh empty active segment

        // The store is usable again, and still holds the directory lock.
        store.set(b"after", b"clear".to_vec())?;
        assert_eq!(store.get(b"after")?, Some(b"clear".to_vec()));
        assert!(BitCask::open(&store.shared.dir, Options::default()).is_err());
        Ok(())
    }

    /// Truncation discards all segments at or above the given id.
    #[test]
    fn truncate() -> Result<()> {
        let opts = Options { max_file_size: 60, buffer_size: 0, ..Options::default() };
        let (_dir, store) = setup_with(opts)?;
        store.set(b"a", b"1".to_vec())?;
        store.set(b"b", b"2".to_vec())?;
        store.set(b"c", b"3".to_vec())?; // seals segment 0
        store.set(b"d", b"4".to_vec())?;
        store.set(b"e", b"5".to_vec())?;
        store.set(b"f", b"6".to_vec())?; // seals segment 1
        store.set(b"g", b"7".to_vec())?;

        store.truncate(1)?;
        for (key, value) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
            assert_eq!(store.get(key)?, Some(value.to_vec()));
        }
        for key in [b"d", b"e", b"f", b"g"] {
            assert_eq!(store.get(key)?, None);
        }

        // The store accepts writes after truncation.
        store.set(b"h", b"8".to_vec())?;
        assert_eq!(store.get(b"h")?, Some(b"8".to_vec()));
        Ok(())
    }

    /// Expired keys read as absent and are excluded from key listings.
    #[test]
    fn expiration() -> Result<()> {
        let (_dir, store) = setup()?;
        let now = util::unix_now();
        store.set_with_expiration(b"eternal", b"v".to_vec(), 0)?;
        store.set_with_expiration(b"fresh", b"v".to_vec(), now + 3600)?;
        store.set_with_expiration(b"stale", b"v".to_vec(), now.saturating_sub(3600).max(1))?;

        assert_eq!(store.get(b"eternal")?, Some(b"v".to_vec()));
        assert_eq!(store.get(b"fresh")?, Some(b"v".to_vec()));
        assert_eq!(store.get(b"stale")?, None);

        let mut keys = store.list_keys()?;
        keys.sort();
        assert_eq!(keys, vec![b"eternal".to_vec(), b"fresh".to_vec()]);
        Ok(())
    }

    /// Repeated reads of the same key are served from the record cache.
    #[test]
    fn cached_reads() -> Result<()> {
        let opts = Options { max_file_size: 60, buffer_size: 0, ..Options::default() };
        let (_dir, store) = setup_with(opts)?;
        for i in 0..6 {
            store.set(format!("k{i}").as_bytes(), format!("v{i}").into_bytes())?;
        }
        // k0 now lives in a sealed segment; read it twice.
        assert_eq!(store.get(b"k0")?, Some(b"v0".to_vec()));
        assert_eq!(store.get(b"k0")?, Some(b"v0".to_vec()));
        Ok(())
    }

    /// The sync hook applies records at the active tail and rejects
    /// position mismatches.
    #[test]
    fn sync_file() -> Result<()> {
        let (_dir, store) = setup()?;
        let record = Record::put(b"x".to_vec(), b"y".to_vec(), 0);
        store.sync_file(0, 0, &record.encode())?;
        assert_eq!(store.get(b"x")?, Some(b"y".to_vec()));

        // Offset mismatch.
        let next = Record::put(b"p".to_vec(), b"q".to_vec(), 0);
        assert!(matches!(store.sync_file(0, 0, &next.encode()), Err(Error::InvalidInput(_))));
        // File id mismatch beyond the next segment.
        assert!(matches!(
            store.sync_file(5, record.size(), &next.encode()),
            Err(Error::InvalidInput(_))
        ));
        // Garbage payload.
        assert!(matches!(store.sync_file(0, record.size(), &[1, 2, 3]), Err(Error::Corrupted(_))));

        // Applying at the next file id rotates first.
        store.sync_file(1, 0, &next.encode())?;
        assert_eq!(store.state()?.active.id, 1);
        assert_eq!(store.get(b"p")?, Some(b"q".to_vec()));
        assert_eq!(store.get(b"x")?, Some(b"y".to_vec()));
        Ok(())
    }

    /// A synced merge marker removes the named segment.
    #[test]
    fn sync_file_merge_marker() -> Result<()> {
        let opts = Options { max_file_size: 60, buffer_size: 0, ..Options::default() };
        let (_dir, store) = setup_with(opts)?;
        store.set(b"k", vec![b'o'; 40])?; // 66 bytes, seals segment 0
        store.set(b"k", b"new".to_vec())?; // lands in segment 1

        let (active_id, active_size) = {
            let state = store.state()?;
            (state.active.id, state.active.size())
        };
        let marker = Record::merge_marker(0);
        store.sync_file(active_id, active_size, &marker.encode())?;

        assert!(!util::data_file_path(&store.shared.dir, 0).exists());
        assert!(!util::hint_file_path(&store.shared.dir, 0).exists());
        assert_eq!(store.get(b"k")?, Some(b"new".to_vec()));
        Ok(())
    }

    /// File metas expose each sealed segment's MD5 digest.
    #[test]
    fn file_metas() -> Result<()> {
        let opts = Options { max_file_size: 60, buffer_size: 0, ..Options::default() };
        let (_dir, store) = setup_with(opts)?;
        for i in 0..7 {
            store.set(format!("k{i}").as_bytes(), format!("v{i}").into_bytes())?;
        }
        let active_id = store.state()?.active.id;
        let metas = store.file_metas()?;
        assert!(!metas.is_empty());
        for meta in &metas {
            assert!(meta.file_id < active_id);
            let computed = util::file_md5(&util::data_file_path(&store.shared.dir, meta.file_id))?;
            assert_eq!(meta.md5, computed, "digest of segment {}", meta.file_id);
        }
        Ok(())
    }

    /// Reopening a store whose highest segment carries a hint file opens a
    /// fresh active segment rather than appending behind the hint.
    #[test]
    fn reopen_after_seal() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("bitcask")?;
        let path = dir.path().join("db");
        let opts = Options { max_file_size: 50, buffer_size: 0, ..Options::default() };
        let store = BitCask::open(path.clone(), opts.clone())?;
        store.set(b"a", b"1".to_vec())?;
        store.set(b"b", b"2".to_vec())?; // seals segment 0, opens 1
        drop(store);

        // Segment 1 is empty; remove it so segment 0 (sealed, hinted) is
        // the highest on disk.
        fs::remove_file(util::data_file_path(&path, 1))?;

        let store = BitCask::open(path, opts)?;
        assert_eq!(store.state()?.active.id, 1);
        store.set(b"c", b"3".to_vec())?;
        assert_eq!(store.get(b"a")?, Some(b"1".to_vec()));
        assert_eq!(store.get(b"c")?, Some(b"3".to_vec()));
        Ok(())
    }
}
