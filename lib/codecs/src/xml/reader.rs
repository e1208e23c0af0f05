//! A hardened pull reader for the tag form.
//!
//! External entity resolution is never performed and documents carrying a DTD
//! are rejected outright. Comments and processing instructions are dropped;
//! CDATA is folded into character data.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{parse_err, XmlElement, XmlError, XmlNode};

/// A pull event produced by [`TagReader`].
#[derive(Debug, Clone, PartialEq)]
pub enum TagEvent {
    /// An element start tag (empty elements are expanded to start + end).
    Start(ElementStart),
    /// An element end tag, carrying the qualified name.
    End(String),
    /// Character data between tags.
    Text(String),
    /// End of the document.
    Eof,
}

/// The parsed contents of a start tag.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementStart {
    /// Qualified name as written.
    pub name: String,
    /// Attributes, excluding namespace declarations.
    pub attributes: Vec<(String, String)>,
    /// Namespace declarations `(prefix, uri)`; empty prefix for the default
    /// namespace.
    pub declarations: Vec<(String, String)>,
}

impl ElementStart {
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
}

/// Streaming pull reader over an in-memory tag-form document.
pub struct TagReader<'a> {
    inner: Reader<&'a [u8]>,
    buf: Vec<u8>,
}

impl<'a> TagReader<'a> {
    /// Creates a reader over `bytes`.
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        let mut inner = Reader::from_reader(bytes);
        let config = inner.config_mut();
        config.trim_text(true);
        config.expand_empty_elements = true;
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Pulls the next structural event.
    pub fn next_event(&mut self) -> Result<TagEvent, XmlError> {
        loop {
            self.buf.clear();
            match self.inner.read_event_into(&mut self.buf) {
                Ok(Event::Start(start)) => return Ok(TagEvent::Start(parse_start(&start)?)),
                Ok(Event::End(end)) => {
                    return Ok(TagEvent::End(
                        String::from_utf8_lossy(end.name().as_ref()).into_owned(),
                    ))
                }
                Ok(Event::Text(text)) => {
                    let text = text.unescape().map_err(parse_err)?;
                    if !text.is_empty() {
                        return Ok(TagEvent::Text(text.into_owned()));
                    }
                }
                Ok(Event::CData(data)) => {
                    return Ok(TagEvent::Text(
                        String::from_utf8_lossy(data.as_ref()).into_owned(),
                    ))
                }
                Ok(Event::Decl(decl)) => {
                    if let Some(encoding) = decl.encoding() {
                        let encoding = encoding.map_err(parse_err)?;
                        let name = String::from_utf8_lossy(&encoding).into_owned();
                        if !name.eq_ignore_ascii_case("utf-8") {
                            return Err(XmlError::EncodingUnsupported(name));
                        }
                    }
                }
                Ok(Event::DocType(_)) => return Err(XmlError::DtdForbidden),
                Ok(Event::Eof) => return Ok(TagEvent::Eof),
                // Comments, processing instructions, and anything else the
                // parser surfaces carry no event semantics here.
                Ok(_) => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Reads the subtree opened by `start` into an owned element, consuming
    /// events through the matching end tag.
    pub fn read_subtree(&mut self, start: ElementStart) -> Result<XmlElement, XmlError> {
        let mut root = XmlElement {
            name: start.name,
            attributes: start.attributes,
            declarations: start.declarations,
            children: Vec::new(),
        };
        let mut stack: Vec<XmlElement> = Vec::new();

        loop {
            match self.next_event()? {
                TagEvent::Start(child) => {
                    stack.push(std::mem::take(&mut root));
                    root = XmlElement {
                        name: child.name,
                        attributes: child.attributes,
                        declarations: child.declarations,
                        children: Vec::new(),
                    };
                }
                TagEvent::Text(text) => root.children.push(XmlNode::Text(text)),
                TagEvent::End(_) => match stack.pop() {
                    Some(mut parent) => {
                        parent.children.push(XmlNode::Element(root));
                        root = parent;
                    }
                    None => return Ok(root),
                },
                TagEvent::Eof => {
                    return Err(XmlError::Parse(quick_xml::Error::from(
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "document ended inside an element",
                        ),
                    )))
                }
            }
        }
    }
}

fn parse_start(start: &BytesStart<'_>) -> Result<ElementStart, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    let mut declarations = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(parse_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(parse_err)?.into_owned();
        if key == "xmlns" {
            declarations.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declarations.push((prefix.to_owned(), value));
        } else {
            attributes.push((key, value));
        }
    }

    Ok(ElementStart {
        name,
        attributes,
        declarations,
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const DOC: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <epcis:EPCISDocument xmlns:epcis="urn:epcglobal:epcis:xsd:2"
            xmlns:prx="https://example.com/custom" schemaVersion="2.0">
          <EPCISBody>
            <EventList>
              <ObjectEvent>
                <action>OBSERVE</action>
                <epcList><epc>urn:epc:id:sgtin:0614141.107346.2017</epc></epcList>
                <prx:custom>value</prx:custom>
              </ObjectEvent>
            </EventList>
          </EPCISBody>
        </epcis:EPCISDocument>
    "#};

    #[test]
    fn root_exposes_declarations_and_attributes() {
        let mut reader = TagReader::from_bytes(DOC.as_bytes());
        let TagEvent::Start(root) = reader.next_event().unwrap() else {
            panic!("expected the root start tag");
        };
        assert_eq!(root.name, "epcis:EPCISDocument");
        assert_eq!(root.local_name(), "EPCISDocument");
        assert_eq!(root.prefix(), Some("epcis"));
        assert_eq!(root.attribute("schemaVersion"), Some("2.0"));
        assert_eq!(
            root.declarations,
            vec![
                ("epcis".to_owned(), "urn:epcglobal:epcis:xsd:2".to_owned()),
                ("prx".to_owned(), "https://example.com/custom".to_owned()),
            ]
        );
    }

    #[test]
    fn subtree_reading_builds_owned_tree() {
        let mut reader = TagReader::from_bytes(DOC.as_bytes());
        let event = loop {
            match reader.next_event().unwrap() {
                TagEvent::Start(start) if start.local_name() == "ObjectEvent" => break start,
                TagEvent::Eof => panic!("no event element found"),
                _ => {}
            }
        };
        let tree = reader.read_subtree(event).unwrap();
        assert_eq!(tree.name, "ObjectEvent");
        assert_eq!(
            tree.child_elements()
                .find(|el| el.name == "action")
                .and_then(|el| el.text()),
            Some("OBSERVE".to_owned())
        );
        let epc_list = tree
            .child_elements()
            .find(|el| el.name == "epcList")
            .unwrap();
        assert_eq!(
            epc_list.child_elements().next().and_then(|el| el.text()),
            Some("urn:epc:id:sgtin:0614141.107346.2017".to_owned())
        );
    }

    #[test]
    fn empty_elements_expand_to_start_and_end() {
        let mut reader = TagReader::from_bytes(b"<a><b/></a>");
        assert!(matches!(reader.next_event().unwrap(), TagEvent::Start(_)));
        assert!(matches!(reader.next_event().unwrap(), TagEvent::Start(s) if s.name == "b"));
        assert_eq!(reader.next_event().unwrap(), TagEvent::End("b".into()));
        assert_eq!(reader.next_event().unwrap(), TagEvent::End("a".into()));
        assert_eq!(reader.next_event().unwrap(), TagEvent::Eof);
    }

    #[test]
    fn doctype_is_rejected() {
        let doc = br#"<?xml version="1.0"?><!DOCTYPE foo SYSTEM "http://x/e.dtd"><foo/>"#;
        let mut reader = TagReader::from_bytes(doc);
        assert!(matches!(
            reader.next_event(),
            Err(XmlError::DtdForbidden)
        ));
    }

    #[test]
    fn non_utf8_encoding_is_rejected() {
        let doc = br#"<?xml version="1.0" encoding="ISO-8859-1"?><foo/>"#;
        let mut reader = TagReader::from_bytes(doc);
        assert!(matches!(
            reader.next_event(),
            Err(XmlError::EncodingUnsupported(_))
        ));
    }
}
