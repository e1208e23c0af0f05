//! Whole-document rewriting between revisions of the tag form.
//!
//! The two compiled templates (`1.x -> 2.0` and `2.0 -> 1.2`) are built once
//! per process and shared immutably across threads. Execution is blocking;
//! the router offloads it to the worker pool.

mod template;

use std::sync::OnceLock;

use bytes::Bytes;

use crate::error::{ConvertError, Result};
use crate::spec::Revision;

pub use template::RevisionTemplate;

/// Feature flags governing which 2.0-only constructs survive a
/// down-conversion. Honored only when the conversion requests legacy
/// identifier normalization; otherwise every construct is omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformFlags {
    /// Keep `AssociationEvent` subtrees.
    pub include_association_event: bool,
    /// Keep `persistentDisposition` elements.
    pub include_persistent_disposition: bool,
    /// Keep `sensorElementList` elements.
    pub include_sensor_element_list: bool,
}

impl TransformFlags {
    /// Every 2.0-only construct survives.
    pub const fn keep_all() -> Self {
        Self {
            include_association_event: true,
            include_persistent_disposition: true,
            include_sensor_element_list: true,
        }
    }

    /// Every 2.0-only construct is omitted.
    pub const fn omit_all() -> Self {
        Self {
            include_association_event: false,
            include_persistent_disposition: false,
            include_sensor_element_list: false,
        }
    }
}

impl Default for TransformFlags {
    fn default() -> Self {
        Self::omit_all()
    }
}

/// The revision rewrite stage backed by the compiled templates.
#[derive(Debug)]
pub struct RevisionTransformer {
    lower_to_v2: RevisionTemplate,
    v2_to_legacy: RevisionTemplate,
}

impl RevisionTransformer {
    /// The process-wide transformer, compiled on first use.
    pub fn shared() -> &'static RevisionTransformer {
        static SHARED: OnceLock<RevisionTransformer> = OnceLock::new();
        SHARED.get_or_init(|| RevisionTransformer {
            lower_to_v2: RevisionTemplate::lower_to_v2(),
            v2_to_legacy: RevisionTemplate::v2_to_legacy(),
        })
    }

    /// Rewrites `input` from `from` to `to`.
    ///
    /// Legacy-to-legacy requests run transitively through 2.0. Directions
    /// with no compiled template fail with an unsupported error.
    pub fn transform(
        &self,
        input: &[u8],
        from: Revision,
        to: Revision,
        flags: TransformFlags,
    ) -> Result<Bytes> {
        if from == to {
            return Ok(Bytes::copy_from_slice(input));
        }
        match (from, to) {
            (Revision::V1_1 | Revision::V1_2, Revision::V2_0) => {
                Ok(self.lower_to_v2.apply(input, to, flags)?.into())
            }
            (Revision::V2_0, Revision::V1_1 | Revision::V1_2) => {
                Ok(self.v2_to_legacy.apply(input, to, flags)?.into())
            }
            (Revision::V1_1 | Revision::V1_2, Revision::V1_1 | Revision::V1_2) => {
                let upper = self.lower_to_v2.apply(input, Revision::V2_0, flags)?;
                Ok(self.v2_to_legacy.apply(&upper, to, flags)?.into())
            }
            (from, to) => Err(ConvertError::unsupported(format!(
                "no compiled template rewrites the tag form from {from} to {to}"
            ))),
        }
    }
}
