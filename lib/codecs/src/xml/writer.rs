//! Policy-driven writers for tag-form fragments.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::{names, parse_err, XmlElement, XmlError, XmlNode};

/// Writes an element subtree as a standalone fragment.
///
/// Two policies are available: the indenting writer produces human-friendly
/// output with two-space indentation, and the embedded writer additionally
/// suppresses re-declaration of the standard EPCIS namespaces so the fragment
/// can be placed under a document header that already declares them.
#[derive(Debug, Clone, Copy)]
pub struct FragmentWriter {
    indent: bool,
    strip_standard_ns: bool,
}

impl FragmentWriter {
    /// A writer producing indented output with all admitted declarations.
    pub const fn indenting() -> Self {
        Self {
            indent: true,
            strip_standard_ns: false,
        }
    }

    /// A writer for fragments embedded under a root that already declares the
    /// standard namespaces.
    pub const fn embedded() -> Self {
        Self {
            indent: true,
            strip_standard_ns: true,
        }
    }

    /// Writes `element`, declaring `extra_declarations` (typically the
    /// event-scoped namespace bindings) on the outermost tag.
    ///
    /// Declarations pass the prefix admission filter of
    /// [`names::is_writable_prefix`]; bindings of standard namespace URIs are
    /// never re-declared by the embedded policy.
    pub fn write(
        &self,
        element: &XmlElement,
        extra_declarations: &[(String, String)],
    ) -> Result<Vec<u8>, XmlError> {
        let mut writer = if self.indent {
            Writer::new_with_indent(Vec::new(), b' ', 2)
        } else {
            Writer::new(Vec::new())
        };
        self.write_element(&mut writer, element, extra_declarations)?;
        Ok(writer.into_inner())
    }

    fn write_element(
        &self,
        writer: &mut Writer<Vec<u8>>,
        element: &XmlElement,
        extra_declarations: &[(String, String)],
    ) -> Result<(), XmlError> {
        let mut start = BytesStart::new(element.name.as_str());

        let mut declared: Vec<&str> = Vec::new();
        // Declarations carried by the element itself are written as-is except
        // under the embedded policy, which suppresses the standard namespaces
        // already declared by the surrounding header.
        for (prefix, uri) in &element.declarations {
            if declared.contains(&prefix.as_str())
                || (self.strip_standard_ns && names::is_standard_uri(uri))
            {
                continue;
            }
            declared.push(prefix);
            push_declaration(&mut start, prefix, uri);
        }
        // Declarations taken from a namespace context pass the admission
        // filter, and bindings of standard URIs are never re-declared.
        for (prefix, uri) in extra_declarations {
            if declared.contains(&prefix.as_str())
                || !names::is_writable_prefix(prefix)
                || names::is_standard_uri(uri)
            {
                continue;
            }
            declared.push(prefix);
            push_declaration(&mut start, prefix, uri);
        }
        for (key, value) in &element.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if element.children.is_empty() {
            writer.write_event(Event::Empty(start)).map_err(parse_err)?;
            return Ok(());
        }

        writer.write_event(Event::Start(start)).map_err(parse_err)?;
        for child in &element.children {
            match child {
                XmlNode::Element(nested) => self.write_element(writer, nested, &[])?,
                XmlNode::Text(text) => writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .map_err(parse_err)?,
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(element.name.as_str())))
            .map_err(parse_err)?;
        Ok(())
    }
}

fn push_declaration(start: &mut BytesStart<'_>, prefix: &str, uri: &str) {
    if prefix.is_empty() {
        start.push_attribute(("xmlns", uri));
    } else {
        let attr_name = format!("xmlns:{prefix}");
        start.push_attribute((attr_name.as_str(), uri));
    }
}
