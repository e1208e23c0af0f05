//! Support for decoding the object (JSON-LD) form of an EPCIS document into a
//! sequence of object nodes: framing cuts the byte stream into one frame per
//! node, format parses a frame into a structured node.

#![deny(missing_docs)]

pub mod format;
pub mod framing;
