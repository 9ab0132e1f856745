use serde::{Deserialize, Serialize};

/// Engine configuration. All fields have usable defaults; construct with
/// struct update syntax to override individual knobs:
///
/// ```ignore
/// let opts = Options { max_file_size: 1 << 20, ..Options::default() };
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Rotation threshold in bytes: once the active segment reaches this
    /// size, it is sealed and a new segment is opened.
    pub max_file_size: u64,
    /// Capacity of the parsed-record cache, in records.
    pub cache_size: usize,
    /// Capacity of the open-segment cache, in file handles.
    pub max_open_files: usize,
    /// Write buffer size of the active segment, in bytes. 0 disables
    /// buffering and writes straight to disk.
    pub buffer_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            cache_size: 4096,
            max_open_files: 128,
            buffer_size: 4096,
        }
    }
}
