use serde::{Deserialize, Serialize};

/// A bitcask result, returning the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A bitcask error. Missing keys and cache misses are not errors, they are
/// represented as `None` values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// A record or hint item failed validation: a CRC mismatch, a reserved
    /// size field, or a torn write inside a segment.
    Corrupted(String),
    /// Clean end of data while scanning a file. Used internally as the
    /// iteration terminator; never surfaced by the public API.
    EndOfData,
    /// An internal invariant was violated. These can't be handled, and
    /// point to a bug.
    Internal(String),
    /// A caller violated an operation's preconditions, e.g. a sync-file
    /// position mismatch.
    InvalidInput(String),
    /// An OS-level I/O error, propagated verbatim as a message.
    IO(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Corrupted(message) => write!(f, "corrupted data: {message}"),
            Error::EndOfData => write!(f, "end of data"),
            Error::Internal(message) => write!(f, "internal error: {message}"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
        }
    }
}

/// Constructs an Error::Corrupted via format!() arguments.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupted(format!($($args)*)) };
}

/// Constructs an Error::InvalidInput via format!() arguments.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)) };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {err}"))
    }
}
