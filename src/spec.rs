//! The conversion specification: serialization formats, schema revisions, and
//! the supported-pair table.

use std::fmt;

use serde::{Deserialize, Serialize};

use epcis_codecs::xml::names;

use crate::error::ConvertError;

/// A document serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// The tag-based (XML) serialization.
    Tag,
    /// The linked-data object (JSON-LD) serialization.
    Object,
}

impl Format {
    /// The content type emitted for documents of this format.
    pub const fn media_type(&self) -> &'static str {
        match self {
            Self::Tag => names::MEDIA_TYPE_XML,
            Self::Object => names::MEDIA_TYPE_JSON_LD,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag => f.write_str("XML"),
            Self::Object => f.write_str("JSON-LD"),
        }
    }
}

/// A schema revision, totally ordered (`1.1 < 1.2 < 2.0`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Revision {
    /// Revision 1.1.
    #[serde(rename = "1.1")]
    V1_1,
    /// Revision 1.2.
    #[serde(rename = "1.2")]
    V1_2,
    /// Revision 2.0.
    #[serde(rename = "2.0")]
    V2_0,
}

impl Revision {
    /// The version string as it appears in `schemaVersion`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V1_1 => "1.1",
            Self::V1_2 => "1.2",
            Self::V2_0 => "2.0",
        }
    }

    /// Parses a `schemaVersion` value.
    pub fn from_schema_version(value: &str) -> Option<Self> {
        match value.trim() {
            "1.1" => Some(Self::V1_1),
            "1.2" => Some(Self::V1_2),
            "2.0" => Some(Self::V2_0),
            _ => None,
        }
    }

    /// True for the 1.x revisions.
    pub const fn is_legacy(&self) -> bool {
        matches!(self, Self::V1_1 | Self::V1_2)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable description of a requested conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSpec {
    /// Source serialization.
    pub from_fmt: Format,
    /// Source revision; `None` requests autodetection.
    #[serde(default)]
    pub from_rev: Option<Revision>,
    /// Target serialization.
    pub to_fmt: Format,
    /// Target revision; defaults to the (detected) source revision.
    #[serde(default)]
    pub to_rev: Option<Revision>,
    /// Rewrite identifiers into the legacy URN form and honor the
    /// down-conversion feature flags.
    #[serde(default)]
    pub normalize_to_legacy_ids: bool,
}

impl ConversionSpec {
    /// Creates a specification converting `from_fmt` into `to_fmt` with
    /// autodetected revisions.
    pub const fn new(from_fmt: Format, to_fmt: Format) -> Self {
        Self {
            from_fmt,
            from_rev: None,
            to_fmt,
            to_rev: None,
            normalize_to_legacy_ids: false,
        }
    }

    /// Pins the source revision.
    pub const fn from_revision(mut self, revision: Revision) -> Self {
        self.from_rev = Some(revision);
        self
    }

    /// Pins the target revision.
    pub const fn to_revision(mut self, revision: Revision) -> Self {
        self.to_rev = Some(revision);
        self
    }

    /// Requests legacy identifier normalization.
    pub const fn normalize_to_legacy_ids(mut self, enabled: bool) -> Self {
        self.normalize_to_legacy_ids = enabled;
        self
    }

    /// Fixes the open revisions against the detected source revision and
    /// checks the pair against the support table.
    pub fn resolve(&self, detected: Revision) -> Result<ResolvedSpec, ConvertError> {
        let from_rev = self.from_rev.unwrap_or(detected);
        let to_rev = self.to_rev.unwrap_or(from_rev);
        let resolved = ResolvedSpec {
            from_fmt: self.from_fmt,
            from_rev,
            to_fmt: self.to_fmt,
            to_rev,
            normalize_to_legacy_ids: self.normalize_to_legacy_ids,
        };
        resolved.validate()?;
        Ok(resolved)
    }
}

/// A conversion specification with both revisions fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSpec {
    /// Source serialization.
    pub from_fmt: Format,
    /// Source revision.
    pub from_rev: Revision,
    /// Target serialization.
    pub to_fmt: Format,
    /// Target revision.
    pub to_rev: Revision,
    /// Legacy identifier normalization requested.
    pub normalize_to_legacy_ids: bool,
}

/// The canonical description of every supported conversion pair, included in
/// unsupported-pair error messages.
pub const SUPPORTED_PAIRS: &str = "Supported conversions: \
    XML 1.1/1.2/2.0 to XML 1.1/1.2/2.0, \
    XML 1.1/1.2/2.0 to JSON-LD 2.0, \
    JSON-LD 2.0 to XML 1.2/2.0, \
    JSON-LD 2.0 to JSON-LD 2.0.";

impl ResolvedSpec {
    /// Checks this pair against the support table, producing an
    /// [`ConvertError::Unsupported`] error carrying the canonical pair list
    /// and a targeted hint where one exists.
    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.is_supported() {
            return Ok(());
        }
        let mut message = format!(
            "Unsupported conversion from {} {} to {} {}. {SUPPORTED_PAIRS}",
            self.from_fmt, self.from_rev, self.to_fmt, self.to_rev,
        );
        if let Some(hint) = self.hint() {
            message.push(' ');
            message.push_str(hint);
        }
        Err(ConvertError::unsupported(message))
    }

    fn is_supported(&self) -> bool {
        match (self.from_fmt, self.to_fmt) {
            (Format::Tag, Format::Tag) => true,
            (Format::Tag, Format::Object) => self.to_rev == Revision::V2_0,
            (Format::Object, Format::Tag) => {
                self.from_rev == Revision::V2_0 && self.to_rev != Revision::V1_1
            }
            (Format::Object, Format::Object) => {
                self.from_rev == Revision::V2_0 && self.to_rev == Revision::V2_0
            }
        }
    }

    fn hint(&self) -> Option<&'static str> {
        if self.from_fmt == Format::Object && self.from_rev != Revision::V2_0 {
            return Some("JSON-LD input is only supported at revision 2.0.");
        }
        match (self.to_fmt, self.to_rev) {
            (Format::Tag, Revision::V1_1) => {
                Some("XML 1.1 output is not supported. Use XML 1.2 or XML 2.0 instead.")
            }
            (Format::Object, rev) if rev != Revision::V2_0 => {
                Some("JSON-LD output is only supported at revision 2.0.")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(
        from_fmt: Format,
        from_rev: Revision,
        to_fmt: Format,
        to_rev: Revision,
    ) -> ResolvedSpec {
        ResolvedSpec {
            from_fmt,
            from_rev,
            to_fmt,
            to_rev,
            normalize_to_legacy_ids: false,
        }
    }

    #[test]
    fn revision_order_is_total() {
        assert!(Revision::V1_1 < Revision::V1_2);
        assert!(Revision::V1_2 < Revision::V2_0);
    }

    #[test]
    fn supported_pairs() {
        for from in [Revision::V1_1, Revision::V1_2, Revision::V2_0] {
            for to in [Revision::V1_1, Revision::V1_2, Revision::V2_0] {
                assert!(resolved(Format::Tag, from, Format::Tag, to)
                    .validate()
                    .is_ok());
            }
            assert!(resolved(Format::Tag, from, Format::Object, Revision::V2_0)
                .validate()
                .is_ok());
        }
        assert!(
            resolved(Format::Object, Revision::V2_0, Format::Tag, Revision::V2_0)
                .validate()
                .is_ok()
        );
        assert!(
            resolved(Format::Object, Revision::V2_0, Format::Tag, Revision::V1_2)
                .validate()
                .is_ok()
        );
        assert!(resolved(
            Format::Object,
            Revision::V2_0,
            Format::Object,
            Revision::V2_0
        )
        .validate()
        .is_ok());
    }

    #[test]
    fn object_to_xml_11_is_rejected_with_hint() {
        let error = resolved(Format::Object, Revision::V2_0, Format::Tag, Revision::V1_1)
            .validate()
            .unwrap_err();
        let message = error.to_string();
        assert!(message.contains("Supported"));
        assert!(message.contains("XML 1.1 output is not supported"));
    }

    #[test]
    fn object_output_below_20_is_rejected() {
        let error = resolved(Format::Tag, Revision::V1_2, Format::Object, Revision::V1_2)
            .validate()
            .unwrap_err();
        assert!(error
            .to_string()
            .contains("JSON-LD output is only supported at revision 2.0."));
    }

    #[test]
    fn resolve_defaults_target_to_source_revision() {
        let spec = ConversionSpec::new(Format::Tag, Format::Tag);
        let resolved = spec.resolve(Revision::V1_2).unwrap();
        assert_eq!(resolved.from_rev, Revision::V1_2);
        assert_eq!(resolved.to_rev, Revision::V1_2);
    }
}
