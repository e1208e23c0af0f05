//! Framing methods that cut a byte stream into frames with node boundaries.

#![deny(missing_docs)]

mod json_object;

use std::fmt;

pub use json_object::{ContextScanOutcome, ContextScanner, JsonNodeDecoder};

/// An error that occurred while producing frames from a byte stream.
#[derive(Debug)]
pub enum FramingError {
    /// The configured chunk size was not a positive number.
    InvalidChunkSize,
    /// The input does not follow the expected document structure.
    Malformed {
        /// Human-readable description of the structural violation.
        message: String,
    },
    /// The input ended before the document structure was closed.
    UnterminatedDocument,
    /// Reading from the underlying byte source failed.
    Io(std::io::Error),
}

impl FramingError {
    /// Creates a `Malformed` error from anything printable.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChunkSize => write!(f, "chunk size must be a positive number"),
            Self::Malformed { message } => write!(f, "malformed document: {message}"),
            Self::UnterminatedDocument => write!(f, "unterminated document"),
            Self::Io(error) => write!(f, "i/o error: {error}"),
        }
    }
}

impl std::error::Error for FramingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FramingError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}
