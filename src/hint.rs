use std::path::Path;

use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::file::BufferedFile;
use crate::keydir::DirItem;

/// Fixed hint file header: the segment id followed by the MD5 digest of
/// the sealed data segment.
pub const HINT_HEADER_SIZE: u64 = 24;

/// Fixed size of an encoded hint item header:
/// `[flag:u8][expiration:u32][value_size:i64][value_pos:i64][key_size:i64]`.
pub const HINT_ITEM_HEADER_SIZE: u64 = 29;

/// One entry of a hint file: the same directional information a full
/// record parse yields, without the value payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HintItem {
    pub flag: u8,
    pub expiration: u32,
    pub value_size: u64,
    pub value_pos: u64,
    pub key: Vec<u8>,
}

impl HintItem {
    pub fn size(&self) -> u64 {
        HINT_ITEM_HEADER_SIZE + self.key.len() as u64
    }

    /// The keydir item this hint contributes for the given segment.
    pub fn to_dir_item(&self, file_id: u64) -> DirItem {
        DirItem {
            flag: self.flag,
            file_id,
            value_pos: self.value_pos,
            value_size: self.value_size,
            expiration: self.expiration,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.push(self.flag);
        buf.extend_from_slice(&self.expiration.to_le_bytes());
        buf.extend_from_slice(&(self.value_size as i64).to_le_bytes());
        buf.extend_from_slice(&(self.value_pos as i64).to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as i64).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf
    }
}

/// The compact side-index of a sealed segment. Restoring from a hint file
/// avoids scanning the segment's record payloads.
pub struct HintFile {
    file: BufferedFile,
    pub id: u64,
    digest: [u8; 16],
}

impl HintFile {
    /// Creates a fresh hint file, replacing any stale one, and writes the
    /// header.
    pub fn create(path: &Path, id: u64, digest: [u8; 16], buffer_size: usize) -> Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let mut file = BufferedFile::create(path, buffer_size)?;
        file.write(&id.to_le_bytes())?;
        file.write(&digest)?;
        Ok(Self { file, id, digest })
    }

    /// Opens an existing hint file and reads its header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = BufferedFile::open(path)?;
        let header = file.read_at(0, HINT_HEADER_SIZE)?;
        if header.len() < HINT_HEADER_SIZE as usize {
            return Err(errcorrupt!("truncated hint file header in {}", path.display()));
        }
        let mut id_buf = [0u8; 8];
        id_buf.copy_from_slice(&header[0..8]);
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&header[8..24]);
        Ok(Self { file, id: u64::from_le_bytes(id_buf), digest })
    }

    /// The MD5 digest of the companion data segment, as recorded at
    /// sealing time.
    pub fn digest(&self) -> [u8; 16] {
        self.digest
    }

    /// Appends one hint item for a keydir entry of the sealed segment.
    pub fn add(&mut self, key: &[u8], item: &DirItem) -> Result<()> {
        let hint = HintItem {
            flag: item.flag,
            expiration: item.expiration,
            value_size: item.value_size,
            value_pos: item.value_pos,
            key: key.to_vec(),
        };
        self.file.write(&hint.encode())
    }

    /// Flushes and fsyncs the hint file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }

    /// Streams every hint item to the visitor, in file order.
    pub fn for_each_item(&self, mut visit: impl FnMut(&HintItem) -> Result<()>) -> Result<()> {
        let mut offset = HINT_HEADER_SIZE;
        loop {
            match self.parse_item_at(offset) {
                Ok(item) => {
                    visit(&item)?;
                    offset += item.size();
                }
                Err(Error::EndOfData) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn parse_item_at(&self, offset: u64) -> Result<HintItem> {
        if offset >= self.file.size() {
            return Err(Error::EndOfData);
        }
        let header = self.file.read_at(offset, HINT_ITEM_HEADER_SIZE)?;
        if header.len() < HINT_ITEM_HEADER_SIZE as usize {
            return Err(errcorrupt!("truncated hint item at offset {offset}"));
        }
        let flag = header[0];
        let expiration = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let value_size = read_i64(&header[5..13]);
        let value_pos = read_i64(&header[13..21]);
        let key_size = read_i64(&header[21..29]);
        if value_size < 0 || value_pos < 0 || key_size < 0 {
            return Err(errcorrupt!("reserved negative size in hint item at offset {offset}"));
        }
        let key = self.file.read_at(offset + HINT_ITEM_HEADER_SIZE, key_size as u64)?;
        if (key.len() as u64) < key_size as u64 {
            return Err(errcorrupt!("truncated hint item key at offset {offset}"));
        }
        Ok(HintItem {
            flag,
            expiration,
            value_size: value_size as u64,
            value_pos: value_pos as u64,
            key,
        })
    }
}

fn read_i64(buf: &[u8]) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    i64::from_le_bytes(b)
}
