use std::fmt;
use std::io;

/// Engine errors.
///
/// IO errors are carried as rendered strings so that `Error` stays
/// `Clone`; iterator status is sticky and gets handed out repeatedly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested key does not exist, or resolves to a tombstone.
    NotFound,
    /// Stored data failed validation: bad checksum, truncated or malformed
    /// record, out-of-order framing. The message carries the offset where
    /// that is meaningful.
    Corruption(String),
    /// The operation is not supported by this build or configuration.
    NotSupported(String),
    /// Invalid caller input.
    InvalidArgument(String),
    /// An IO error from the underlying files.
    Io(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// An engine Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
