#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod bitcask;
pub mod error;
pub mod file;
pub mod hint;
pub mod keydir;
pub mod lru;
mod merge;
pub mod options;
pub mod record;
pub mod segment;
pub mod snapshot;
pub mod util;

pub use bitcask::{BitCask, FileMeta};
pub use error::{Error, Result};
pub use options::Options;
pub use snapshot::{Snapshot, SnapshotIter};
