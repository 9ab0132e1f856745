use std::sync::Arc;

use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::file::BufferedFile;
use crate::lru::Cache;

/// Fixed size of an encoded record header:
/// `[crc32:u32][flag:u8][expiration:u32][value_size:i64][key_size:i64]`.
pub const RECORD_HEADER_SIZE: u64 = 25;

/// The record is a tombstone; the key is deleted and no value bytes are
/// written.
pub const FLAG_DELETED: u8 = 1 << 0;
/// An administrative record emitted after compaction removes a segment.
/// The `value_size` field carries the removed segment's id; no key or
/// value bytes are written.
pub const FLAG_MERGE_MARKER: u8 = 1 << 1;

/// A single log entry, the atomic unit of the on-disk format. Records are
/// encoded little-endian as the header above followed by the value bytes
/// and then the key bytes. The CRC-32/IEEE covers the header minus the CRC
/// field itself, then the value, then the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub flag: u8,
    /// Expiration as seconds since the Unix epoch; 0 never expires.
    pub expiration: u32,
    /// The value payload length, or the doomed segment id for merge
    /// markers. Negative values are reserved and treated as corruption.
    pub value_size: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    /// A live key/value record.
    pub fn put(key: Vec<u8>, value: Vec<u8>, expiration: u32) -> Self {
        let value_size = value.len() as i64;
        Self { flag: 0, expiration, value_size, key, value }
    }

    /// A tombstone marking the key as deleted.
    pub fn tombstone(key: Vec<u8>) -> Self {
        Self { flag: FLAG_DELETED, expiration: 0, value_size: 0, key, value: Vec::new() }
    }

    /// A merge marker recording the removal of the given segment.
    pub fn merge_marker(file_id: u64) -> Self {
        Self {
            flag: FLAG_MERGE_MARKER,
            expiration: 0,
            value_size: file_id as i64,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flag & FLAG_DELETED != 0
    }

    pub fn is_merge_marker(&self) -> bool {
        self.flag & FLAG_MERGE_MARKER != 0
    }

    /// The segment id a merge marker refers to.
    pub fn merge_target(&self) -> u64 {
        self.value_size as u64
    }

    /// The encoded size: header plus key plus any value payload. Tombstones
    /// and merge markers carry no value bytes.
    pub fn size(&self) -> u64 {
        RECORD_HEADER_SIZE + self.key.len() as u64 + self.value.len() as u64
    }

    /// Encodes the record, computing the CRC over everything after the CRC
    /// field in encoded order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.extend_from_slice(&[0u8; 4]);
        buf.push(self.flag);
        buf.extend_from_slice(&self.expiration.to_le_bytes());
        buf.extend_from_slice(&self.value_size.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as i64).to_le_bytes());
        buf.extend_from_slice(&self.value);
        buf.extend_from_slice(&self.key);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[4..]);
        let crc = hasher.finalize();
        buf[0..4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a single record from an in-memory buffer, validating the
    /// CRC. The buffer may be longer than the record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_SIZE as usize {
            return Err(errcorrupt!("record buffer too short: {} bytes", buf.len()));
        }
        let (header, rest) = buf.split_at(RECORD_HEADER_SIZE as usize);
        let (flag, expiration, value_size, key_size) = decode_header(header)?;
        let value_len = payload_value_len(flag, value_size);
        let key_len = if flag & FLAG_MERGE_MARKER != 0 { 0 } else { key_size as usize };
        if rest.len() < value_len + key_len {
            return Err(errcorrupt!("record buffer truncated after header"));
        }
        let value = rest[..value_len].to_vec();
        let key = rest[value_len..value_len + key_len].to_vec();
        let record = Self { flag, expiration, value_size, key, value };
        record.verify_crc(header)?;
        Ok(record)
    }

    fn verify_crc(&self, header: &[u8]) -> Result<()> {
        let stored = read_u32(&header[0..4]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[4..]);
        hasher.update(&self.value);
        hasher.update(&self.key);
        if hasher.finalize() != stored {
            return Err(errcorrupt!("record crc mismatch"));
        }
        Ok(())
    }
}

/// Parses one record at the given offset of a file. An offset at or past
/// the end of data is the clean scan terminator `EndOfData`; anything
/// partially readable beyond it is `Corrupted`.
pub fn parse_record_at(f: &BufferedFile, offset: u64) -> Result<Record> {
    if offset >= f.size() {
        return Err(Error::EndOfData);
    }
    let header = f.read_at(offset, RECORD_HEADER_SIZE)?;
    if header.len() < RECORD_HEADER_SIZE as usize {
        return Err(errcorrupt!("truncated record header at offset {offset}"));
    }
    let (flag, expiration, value_size, key_size) = decode_header(&header)?;
    let value_len = payload_value_len(flag, value_size) as u64;
    let key_len = if flag & FLAG_MERGE_MARKER != 0 { 0 } else { key_size as u64 };

    let value = f.read_at(offset + RECORD_HEADER_SIZE, value_len)?;
    let key = f.read_at(offset + RECORD_HEADER_SIZE + value_len, key_len)?;
    if (value.len() as u64) < value_len || (key.len() as u64) < key_len {
        return Err(errcorrupt!("truncated record payload at offset {offset}"));
    }

    let record = Record { flag, expiration, value_size, key, value };
    record.verify_crc(&header).map_err(|_| errcorrupt!("record crc mismatch at offset {offset}"))?;
    Ok(record)
}

/// Splits a 25-byte header into its fields, rejecting reserved negative
/// sizes.
fn decode_header(header: &[u8]) -> Result<(u8, u32, i64, i64)> {
    let flag = header[4];
    let expiration = read_u32(&header[5..9]);
    let value_size = read_i64(&header[9..17]);
    let key_size = read_i64(&header[17..25]);
    if key_size < 0 || value_size < 0 {
        return Err(errcorrupt!("reserved negative size in record header"));
    }
    Ok((flag, expiration, value_size, key_size))
}

/// The number of value bytes actually present on disk: tombstones and
/// merge markers write none, regardless of the `value_size` field.
fn payload_value_len(flag: u8, value_size: i64) -> usize {
    if flag & (FLAG_DELETED | FLAG_MERGE_MARKER) != 0 {
        0
    } else {
        value_size as usize
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(b)
}

fn read_i64(buf: &[u8]) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    i64::from_le_bytes(b)
}

/// A pinned LRU over parsed records, keyed by (file id, record start
/// offset). Records are pure data, so eviction needs no callback.
pub struct RecordCache {
    cache: Cache<(u64, u64), Arc<Record>>,
}

impl RecordCache {
    pub fn new(capacity: usize) -> Self {
        Self { cache: Cache::new(capacity, None) }
    }

    pub fn pin(&mut self, file_id: u64, offset: u64) -> Option<Arc<Record>> {
        self.cache.pin(&(file_id, offset))
    }

    pub fn unpin(&mut self, file_id: u64, offset: u64) {
        self.cache.unpin(&(file_id, offset));
    }

    /// Inserts a freshly parsed record and pins it for the caller.
    pub fn insert(&mut self, file_id: u64, offset: u64, record: Arc<Record>) -> Arc<Record> {
        self.cache.put((file_id, offset), record.clone());
        self.cache.pin(&(file_id, offset));
        record
    }

    /// Drops every cached record of a segment. Called when a segment is
    /// deleted, since its id may later be reused.
    pub fn remove_file(&mut self, file_id: u64) {
        self.cache.remove_if(|&(id, _)| id == file_id);
    }

    pub fn close(&mut self) {
        self.cache.close();
    }
}
