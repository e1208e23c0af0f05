//! Pull-based reading and policy-driven writing of the tag (XML) form.

#![deny(missing_docs)]

pub mod names;
pub mod reader;
pub mod writer;

use std::fmt;

pub use reader::{ElementStart, TagEvent, TagReader};
pub use writer::FragmentWriter;

/// An error raised while reading or writing the tag form.
#[derive(Debug)]
pub enum XmlError {
    /// The underlying parser or writer failed.
    Parse(quick_xml::Error),
    /// The document carries a DTD, which is never processed.
    DtdForbidden,
    /// The document declares an encoding other than UTF-8.
    EncodingUnsupported(String),
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(error) => write!(f, "{error}"),
            Self::DtdForbidden => write!(f, "document type definitions are not processed"),
            Self::EncodingUnsupported(enc) => {
                write!(f, "unsupported document encoding {enc:?}, expected UTF-8")
            }
        }
    }
}

impl std::error::Error for XmlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(error) => Some(error),
            _ => None,
        }
    }
}

impl From<quick_xml::Error> for XmlError {
    fn from(error: quick_xml::Error) -> Self {
        Self::Parse(error)
    }
}

pub(crate) fn parse_err(error: impl Into<quick_xml::Error>) -> XmlError {
    XmlError::Parse(error.into())
}

/// An owned XML element subtree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    /// The qualified name as written in the source.
    pub name: String,
    /// Attributes, excluding namespace declarations.
    pub attributes: Vec<(String, String)>,
    /// Namespace declarations on this element as `(prefix, uri)`; the default
    /// namespace uses an empty prefix.
    pub declarations: Vec<(String, String)>,
    /// Child nodes in document order.
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Creates an element with the given qualified name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The local part of the qualified name.
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    /// The prefix part of the qualified name, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(p, _)| p)
    }

    /// Looks up an attribute by qualified name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Child elements, skipping text nodes.
    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(el) => Some(el),
            XmlNode::Text(_) => None,
        })
    }

    /// The concatenated text directly under this element, if any.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        for node in &self.children {
            if let XmlNode::Text(t) = node {
                out.push_str(t);
            }
        }
        (!out.is_empty()).then_some(out)
    }
}

/// A node within an element subtree.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    /// A nested element.
    Element(XmlElement),
    /// Character data.
    Text(String),
}
