//! Parsing of framed object-form nodes into structured values.

#![deny(missing_docs)]

mod object_node;

pub use object_node::{EventKind, HeaderFields, NodeKind, ObjectValue};
