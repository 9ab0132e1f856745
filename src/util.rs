use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::error::Result;

/// Formats a segment id as the zero-padded base name shared by data and
/// hint files, e.g. 42 → "000000042".
pub fn file_base(id: u64) -> String {
    format!("{id:09}")
}

/// Returns the path of the data file for the given segment id.
pub fn data_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}.data", file_base(id)))
}

/// Returns the path of the hint file for the given segment id.
pub fn hint_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}.hint", file_base(id)))
}

/// Parses a segment id from a data file name. Returns None for anything
/// that isn't `<decimal id>.data`; such directory entries are ignored.
pub fn id_from_data_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".data")?.parse().ok()
}

/// Computes the MD5 digest of an entire file.
pub fn file_md5(path: &Path) -> Result<[u8; 16]> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

/// The current wall-clock time as whole seconds since the Unix epoch, the
/// unit record expirations are expressed in.
pub fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
