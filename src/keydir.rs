use std::collections::HashMap;

use crate::record::{FLAG_DELETED, RECORD_HEADER_SIZE};

/// The in-memory locator of a key's most recent record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirItem {
    pub flag: u8,
    /// The segment holding the record.
    pub file_id: u64,
    /// Byte offset of the value within the segment.
    pub value_pos: u64,
    pub value_size: u64,
    /// Seconds since the Unix epoch; 0 never expires.
    pub expiration: u32,
}

impl DirItem {
    pub fn is_deleted(&self) -> bool {
        self.flag & FLAG_DELETED != 0
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.expiration != 0 && self.expiration <= now
    }

    /// The offset the record starts at, i.e. where its header lives.
    pub fn record_offset(&self) -> u64 {
        self.value_pos - RECORD_HEADER_SIZE
    }
}

/// The hash index mapping each key to its current directory item. One
/// global instance indexes the whole store; a second one tracks only the
/// active segment's keys, feeding the hint file on rotation.
#[derive(Default)]
pub struct KeyDir {
    map: HashMap<Vec<u8>, DirItem>,
}

impl KeyDir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&DirItem> {
        self.map.get(key)
    }

    /// Inserts or replaces the item for a key.
    pub fn put(&mut self, key: Vec<u8>, item: DirItem) {
        self.map.insert(key, item);
    }

    /// Removes a key, returning its item if it was present.
    pub fn del(&mut self, key: &[u8]) -> Option<DirItem> {
        self.map.remove(key)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over (key, item) pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &DirItem)> {
        self.map.iter()
    }
}
