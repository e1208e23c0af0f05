//! A streaming converter for EPCIS documents between the XML ("tag") and
//! JSON-LD ("object") serializations, across schema revisions 1.1, 1.2, and
//! 2.0.
//!
//! The entry point is the [`Router`], which composes a demand-driven
//! pipeline from a [`ConversionSpec`]: byte sources with restart support,
//! per-event streaming converters for both serializations, a blocking
//! whole-document revision transformer offloaded to a worker pool, and
//! fixed-size output chunking. A scoped [`NamespaceContext`] keeps
//! document-wide and per-event namespace bindings partitioned through every
//! stage.
//!
//! ```no_run
//! use epcis_convert::{ByteSource, ConversionSpec, Format, Revision, Router};
//!
//! # async fn demo(input: bytes::Bytes) -> Result<(), epcis_convert::ConvertError> {
//! let router = Router::new();
//! let spec = ConversionSpec::new(Format::Object, Format::Tag)
//!     .from_revision(Revision::V2_0)
//!     .to_revision(Revision::V2_0);
//! let conversion = router.convert(ByteSource::from_bytes(input), spec)?;
//! let xml = conversion.into_bytes().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod convert;
pub mod diagnostics;
pub mod error;
pub mod model;
pub mod namespace;
pub mod sources;
pub mod spec;
pub mod topology;
pub mod transform;

pub use convert::{ContextResolver, DefaultContextResolver, DocFlavor};
pub use diagnostics::{Diagnostic, Diagnostics, ExitCondition};
pub use error::{ConvertError, ErrorKind, Result};
pub use model::{normalize, Event, EventModel, GenericEventModel};
pub use namespace::NamespaceContext;
pub use sources::{ByteSource, ChunkStream, SourceRetry, SourceState};
pub use spec::{ConversionSpec, Format, ResolvedSpec, Revision};
pub use topology::{Conversion, EventStream, Router, WorkerPool};
pub use transform::{RevisionTransformer, TransformFlags};
