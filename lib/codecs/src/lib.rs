//! A collection of codecs that re-frame EPCIS byte streams: fixed-size output
//! chunking, per-node framing of the JSON-LD object form, and pull-based
//! reading/writing of the XML tag form.

#![deny(missing_docs)]

pub mod chunking;
pub mod decoding;
pub mod xml;

pub use chunking::{ChunkedStream, Chunker, ChunkerConfig};
pub use decoding::{
    framing::{ContextScanOutcome, ContextScanner, FramingError, JsonNodeDecoder},
    format::{EventKind, HeaderFields, NodeKind, ObjectValue},
};
