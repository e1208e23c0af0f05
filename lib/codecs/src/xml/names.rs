//! Namespace URIs, canonical prefixes, and the prefix admission filter for
//! declarations written to the tag form.

/// EPCIS 2.0 root namespace.
pub const EPCIS_2_NS: &str = "urn:epcglobal:epcis:xsd:2";
/// EPCIS 1.x root namespace.
pub const EPCIS_1_NS: &str = "urn:epcglobal:epcis:xsd:1";
/// EPCIS 2.0 query namespace.
pub const EPCIS_QUERY_2_NS: &str = "urn:epcglobal:epcis-query:xsd:2";
/// EPCIS 1.x query namespace.
pub const EPCIS_QUERY_1_NS: &str = "urn:epcglobal:epcis-query:xsd:1";
/// XML Schema instance namespace.
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
/// CBV master-data namespace.
pub const CBVMDA_NS: &str = "urn:epcglobal:cbv:mda";
/// Standard Business Document Header namespace.
pub const SBDH_NS: &str =
    "http://www.unece.org/cefact/namespaces/StandardBusinessDocumentHeader";

/// Canonical prefix for the EPCIS root namespace.
pub const EPCIS_PREFIX: &str = "epcis";
/// Canonical prefix for the EPCIS query namespace.
pub const EPCIS_QUERY_PREFIX: &str = "epcisq";
/// Canonical prefix for the schema-instance namespace.
pub const XSI_PREFIX: &str = "xsi";
/// Canonical prefix for the CBV master-data namespace.
pub const CBVMDA_PREFIX: &str = "cbvmda";

/// The published JSON-LD context for EPCIS 2.0.
pub const EPCIS_CONTEXT_URL: &str =
    "https://ref.gs1.org/standards/epcis/epcis-context.jsonld";

/// Media type of the tag serialization.
pub const MEDIA_TYPE_XML: &str = "application/xml";
/// Media type of the object serialization.
pub const MEDIA_TYPE_JSON_LD: &str = "application/ld+json";

/// Prefixes that are always recognized and never re-declared from user input.
pub const STANDARD_PREFIXES: &[&str] = &[
    EPCIS_PREFIX,
    EPCIS_QUERY_PREFIX,
    XSI_PREFIX,
    CBVMDA_PREFIX,
    "xml",
    "xmlns",
];

/// Namespace URIs that are infrastructure rather than user extensions: the
/// EPCIS roots, the schema-instance and master-data namespaces, and the SBDH
/// envelope namespace.
pub const STANDARD_URIS: &[&str] = &[
    EPCIS_2_NS,
    EPCIS_1_NS,
    EPCIS_QUERY_2_NS,
    EPCIS_QUERY_1_NS,
    XSI_NS,
    CBVMDA_NS,
    SBDH_NS,
];

/// True when `uri` belongs to a standard namespace.
pub fn is_standard_uri(uri: &str) -> bool {
    STANDARD_URIS.contains(&uri)
}

/// True when `prefix` is a standard prefix.
pub fn is_standard_prefix(prefix: &str) -> bool {
    STANDARD_PREFIXES.contains(&prefix)
}

/// Admission filter for prefixes written as namespace declarations.
///
/// A prefix passes only when it is non-empty, contains no colon or slash,
/// does not start with `xmlns`, does not start with `http`, and is neither a
/// standard prefix nor one of the pre-declared root prefixes.
pub fn is_writable_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && !prefix.contains(':')
        && !prefix.contains('/')
        && !prefix.starts_with("xmlns")
        && !prefix.starts_with("http")
        && !is_standard_prefix(prefix)
}
