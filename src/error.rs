//! The conversion error taxonomy.

use epcis_codecs::decoding::framing::FramingError;
use epcis_codecs::xml::XmlError;
use snafu::Snafu;

/// Convenience alias used across the crate.
pub type Result<T, E = ConvertError> = std::result::Result<T, E>;

/// A fatal conversion failure.
///
/// The first error terminates the output stream; recoverable conditions are
/// reported through the diagnostics side channel instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConvertError {
    /// A builder or configuration value was rejected.
    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument {
        /// What was rejected and why.
        message: String,
    },

    /// The requested conversion, input revision, or event type is not
    /// supported.
    #[snafu(display("{message}"))]
    Unsupported {
        /// Full message, including the supported-pair list for pair errors.
        message: String,
    },

    /// The input is not a well-formed document of the declared serialization.
    #[snafu(display("malformed input: {message}"))]
    MalformedInput {
        /// What the parser stumbled over.
        message: String,
    },

    /// Event `sequence` could not be parsed into the event model.
    #[snafu(display("failed to unmarshal event {sequence}: {message}"))]
    UnmarshalFailed {
        /// 1-based position of the event in input order.
        sequence: u64,
        /// Underlying parse failure.
        message: String,
    },

    /// Event `sequence` could not be serialized.
    #[snafu(display("failed to marshal event {sequence}: {message}"))]
    MarshalFailed {
        /// 1-based position of the event in input order.
        sequence: u64,
        /// Underlying serialization failure.
        message: String,
    },

    /// The underlying byte reader failed.
    #[snafu(display("i/o failure: {source}"))]
    #[snafu(context(false))]
    Io {
        /// The reader error.
        source: std::io::Error,
    },

    /// A compiled revision template failed to execute.
    #[snafu(display("revision transform failed: {message}"))]
    TransformFailed {
        /// Underlying template failure.
        message: String,
    },

    /// A bounded buffer could not make progress against its consumer.
    #[snafu(display("resource exhausted: {message}"))]
    ResourceExhausted {
        /// Which buffer gave up, and why.
        message: String,
    },
}

/// The kind of a [`ConvertError`], used for exit-condition reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`ConvertError::InvalidArgument`].
    InvalidArgument,
    /// See [`ConvertError::Unsupported`].
    Unsupported,
    /// See [`ConvertError::MalformedInput`].
    MalformedInput,
    /// See [`ConvertError::UnmarshalFailed`].
    UnmarshalFailed,
    /// See [`ConvertError::MarshalFailed`].
    MarshalFailed,
    /// See [`ConvertError::Io`].
    Io,
    /// See [`ConvertError::TransformFailed`].
    TransformFailed,
    /// See [`ConvertError::ResourceExhausted`].
    ResourceExhausted,
}

impl ConvertError {
    /// Creates an [`ConvertError::InvalidArgument`] error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an [`ConvertError::Unsupported`] error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Creates a [`ConvertError::MalformedInput`] error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

    /// Creates an [`ConvertError::UnmarshalFailed`] error for event
    /// `sequence`.
    pub fn unmarshal(sequence: u64, message: impl Into<String>) -> Self {
        Self::UnmarshalFailed {
            sequence,
            message: message.into(),
        }
    }

    /// Creates a [`ConvertError::MarshalFailed`] error for event `sequence`.
    pub fn marshal(sequence: u64, message: impl Into<String>) -> Self {
        Self::MarshalFailed {
            sequence,
            message: message.into(),
        }
    }

    /// Creates a [`ConvertError::TransformFailed`] error.
    pub fn transform(message: impl Into<String>) -> Self {
        Self::TransformFailed {
            message: message.into(),
        }
    }

    /// Creates a [`ConvertError::ResourceExhausted`] error.
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::MalformedInput { .. } => ErrorKind::MalformedInput,
            Self::UnmarshalFailed { .. } => ErrorKind::UnmarshalFailed,
            Self::MarshalFailed { .. } => ErrorKind::MarshalFailed,
            Self::Io { .. } => ErrorKind::Io,
            Self::TransformFailed { .. } => ErrorKind::TransformFailed,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
        }
    }

    /// The event sequence number carried by the error, when defined.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::UnmarshalFailed { sequence, .. } | Self::MarshalFailed { sequence, .. } => {
                Some(*sequence)
            }
            _ => None,
        }
    }
}

impl From<FramingError> for ConvertError {
    fn from(error: FramingError) -> Self {
        match error {
            FramingError::InvalidChunkSize => {
                Self::invalid_argument("chunk size must be a positive number")
            }
            FramingError::Malformed { message } => Self::malformed(message),
            FramingError::UnterminatedDocument => Self::malformed("unterminated document"),
            FramingError::Io(source) => Self::Io { source },
        }
    }
}

impl From<XmlError> for ConvertError {
    fn from(error: XmlError) -> Self {
        Self::malformed(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_sequences() {
        let error = ConvertError::unmarshal(7, "bad field");
        assert_eq!(error.kind(), ErrorKind::UnmarshalFailed);
        assert_eq!(error.sequence(), Some(7));
        assert_eq!(error.to_string(), "failed to unmarshal event 7: bad field");

        assert_eq!(
            ConvertError::malformed("x").kind(),
            ErrorKind::MalformedInput
        );
        assert_eq!(ConvertError::malformed("x").sequence(), None);
    }

    #[test]
    fn framing_errors_map_to_kinds() {
        assert_eq!(
            ConvertError::from(FramingError::InvalidChunkSize).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            ConvertError::from(FramingError::UnterminatedDocument).kind(),
            ErrorKind::MalformedInput
        );
    }
}
