use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Binstore errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid user input: empty keys, duplicate keys, declared length or
    /// hash mismatches, streams exceeding their declared length.
    InvalidInput(String),
    /// The requested key is not present in the index.
    NotFound(String),
    /// An IO error.
    IO(String),
    /// The operation was cancelled at an admission checkpoint or by store
    /// shutdown.
    Cancelled,
    /// The working folder is damaged beyond truncation recovery, typically a
    /// data file shorter than the committed length recorded in the header.
    Corruption(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::NotFound(key) => write!(f, "key not found: {key}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A binstore Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
