//! The per-event converters between the two serializations.

pub mod json_to_xml;
pub mod xml_to_json;

use epcis_codecs::xml::{names, TagEvent, TagReader};

use crate::error::{ConvertError, Result};
use crate::spec::Revision;

pub use json_to_xml::{ContextResolver, DefaultContextResolver, JsonToXml};
pub use xml_to_json::{TagDocParser, XmlToJson};

/// The two EPCIS document flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFlavor {
    /// A plain `EPCISDocument`.
    Regular,
    /// An `EPCISQueryDocument` wrapping events in a query-results envelope.
    Query,
}

impl DocFlavor {
    /// True for the plain document flavor.
    pub const fn is_regular(&self) -> bool {
        matches!(self, Self::Regular)
    }
}

/// Document-level facts captured while reading a header, fed to the opposite
/// serialization's header writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMeta {
    /// The document flavor.
    pub flavor: DocFlavor,
    /// The declared `schemaVersion`, verbatim.
    pub schema_version: Option<String>,
    /// The creation timestamp as `(attribute name, value)`, preserving
    /// whether the source used `creationDate` or `createdAt`.
    pub creation: Option<(String, String)>,
    /// `subscriptionID` of a query document.
    pub subscription_id: Option<String>,
    /// `queryName` of a query document.
    pub query_name: Option<String>,
    /// The master-data namespace is referenced and must be declared.
    pub declares_cbvmda: bool,
}

impl DocumentMeta {
    /// A regular-document header with nothing captured yet.
    pub fn empty() -> Self {
        Self {
            flavor: DocFlavor::Regular,
            schema_version: None,
            creation: None,
            subscription_id: None,
            query_name: None,
            declares_cbvmda: false,
        }
    }
}

/// Reads up to the root start tag of a tag-form document and derives the
/// source revision from the root namespace, refined by `schemaVersion`.
pub fn sniff_tag_revision(bytes: &[u8]) -> Result<Revision> {
    let mut reader = TagReader::from_bytes(bytes);
    loop {
        match reader.next_event()? {
            TagEvent::Start(start) => {
                let version = start
                    .attribute("schemaVersion")
                    .and_then(Revision::from_schema_version);
                let family = start.declarations.iter().find_map(|(_, uri)| {
                    match uri.as_str() {
                        names::EPCIS_1_NS | names::EPCIS_QUERY_1_NS => Some(Revision::V1_2),
                        names::EPCIS_2_NS | names::EPCIS_QUERY_2_NS => Some(Revision::V2_0),
                        _ => None,
                    }
                });
                return match (family, version) {
                    // The 1.x family shares one namespace; the attribute
                    // distinguishes 1.1 from 1.2.
                    (Some(Revision::V1_2), Some(v)) if v.is_legacy() => Ok(v),
                    (Some(family), _) => Ok(family),
                    (None, Some(v)) => Ok(v),
                    (None, None) => Err(ConvertError::unsupported(
                        "input revision is not recognizable from the document root",
                    )),
                };
            }
            TagEvent::Eof => {
                return Err(ConvertError::malformed(
                    "document has no root element",
                ))
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_revisions_from_root() {
        let v12 = br#"<epcis:EPCISDocument xmlns:epcis="urn:epcglobal:epcis:xsd:1" schemaVersion="1.2"/>"#;
        assert_eq!(sniff_tag_revision(v12).unwrap(), Revision::V1_2);

        let v11 = br#"<epcis:EPCISDocument xmlns:epcis="urn:epcglobal:epcis:xsd:1" schemaVersion="1.1"/>"#;
        assert_eq!(sniff_tag_revision(v11).unwrap(), Revision::V1_1);

        let v2 = br#"<epcis:EPCISDocument xmlns:epcis="urn:epcglobal:epcis:xsd:2" schemaVersion="2.0"/>"#;
        assert_eq!(sniff_tag_revision(v2).unwrap(), Revision::V2_0);

        let unknown = br#"<Document xmlns="https://example.com/"/>"#;
        assert!(matches!(
            sniff_tag_revision(unknown),
            Err(ConvertError::Unsupported { .. })
        ));
    }
}
