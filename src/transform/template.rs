//! The compiled rewrite programs behind the revision transformer.
//!
//! A template is an event-rewriting pass over the tag form: namespace URIs
//! are swapped between the revision families, the root `schemaVersion` is
//! restamped, 1.x `extension` wrappers are unwrapped on the way up, and
//! 2.0-only constructs are dropped or re-wrapped on the way down.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use epcis_codecs::xml::{names, ElementStart, TagEvent, TagReader, XmlError};

use crate::spec::Revision;

use super::TransformFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    LowerToV2,
    V2ToLegacy,
}

/// One compiled rewrite direction.
#[derive(Debug)]
pub struct RevisionTemplate {
    direction: Direction,
}

impl RevisionTemplate {
    pub(crate) fn lower_to_v2() -> Self {
        Self {
            direction: Direction::LowerToV2,
        }
    }

    pub(crate) fn v2_to_legacy() -> Self {
        Self {
            direction: Direction::V2ToLegacy,
        }
    }

    fn rewrite_uri<'a>(&self, uri: &'a str) -> &'a str {
        match self.direction {
            Direction::LowerToV2 => match uri {
                names::EPCIS_1_NS => names::EPCIS_2_NS,
                names::EPCIS_QUERY_1_NS => names::EPCIS_QUERY_2_NS,
                other => other,
            },
            Direction::V2ToLegacy => match uri {
                names::EPCIS_2_NS => names::EPCIS_1_NS,
                names::EPCIS_QUERY_2_NS => names::EPCIS_QUERY_1_NS,
                other => other,
            },
        }
    }

    /// Runs the template over a whole document, stamping `target` as the
    /// output revision.
    pub fn apply(
        &self,
        input: &[u8],
        target: Revision,
        flags: TransformFlags,
    ) -> Result<Vec<u8>, XmlError> {
        let mut reader = TagReader::from_bytes(input);
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(write_err)?;

        let mut depth = 0usize;
        let mut root_seen = false;
        // Depths of dropped 1.x extension wrappers whose end tags must also
        // be swallowed.
        let mut unwrapped: Vec<usize> = Vec::new();
        // Depths of events that were re-wrapped in an extension element.
        let mut wrapped: Vec<usize> = Vec::new();

        loop {
            match reader.next_event()? {
                TagEvent::Start(start) => {
                    depth += 1;

                    if !root_seen {
                        root_seen = true;
                        self.write_start(&mut writer, &start, Some(target))?;
                        continue;
                    }

                    match self.direction {
                        Direction::LowerToV2
                            if matches!(start.local_name(), "extension" | "baseExtension")
                                && start.attributes.is_empty()
                                && start.prefix().is_none() =>
                        {
                            unwrapped.push(depth);
                            continue;
                        }
                        Direction::V2ToLegacy => {
                            if self.dropped_on_downgrade(&start, flags) {
                                skip_subtree(&mut reader)?;
                                depth -= 1;
                                continue;
                            }
                            if start.local_name() == "TransformationEvent" {
                                writer
                                    .write_event(Event::Start(BytesStart::new("extension")))
                                    .map_err(write_err)?;
                                wrapped.push(depth);
                            }
                        }
                        _ => {}
                    }
                    self.write_start(&mut writer, &start, None)?;
                }
                TagEvent::End(name) => {
                    if unwrapped.last() == Some(&depth) {
                        unwrapped.pop();
                        depth -= 1;
                        continue;
                    }
                    writer
                        .write_event(Event::End(BytesEnd::new(name.as_str())))
                        .map_err(write_err)?;
                    if wrapped.last() == Some(&depth) {
                        wrapped.pop();
                        writer
                            .write_event(Event::End(BytesEnd::new("extension")))
                            .map_err(write_err)?;
                    }
                    depth = depth.saturating_sub(1);
                }
                TagEvent::Text(text) => {
                    writer
                        .write_event(Event::Text(BytesText::new(&text)))
                        .map_err(write_err)?;
                }
                TagEvent::Eof => break,
            }
        }

        Ok(writer.into_inner())
    }

    fn dropped_on_downgrade(&self, start: &ElementStart, flags: TransformFlags) -> bool {
        match start.local_name() {
            "AssociationEvent" => !flags.include_association_event,
            "persistentDisposition" => !flags.include_persistent_disposition,
            "sensorElementList" => !flags.include_sensor_element_list,
            _ => false,
        }
    }

    fn write_start(
        &self,
        writer: &mut Writer<Vec<u8>>,
        start: &ElementStart,
        restamp: Option<Revision>,
    ) -> Result<(), XmlError> {
        let mut out = BytesStart::new(start.name.as_str());
        for (prefix, uri) in &start.declarations {
            let uri = self.rewrite_uri(uri);
            if prefix.is_empty() {
                out.push_attribute(("xmlns", uri));
            } else {
                let name = format!("xmlns:{prefix}");
                out.push_attribute((name.as_str(), uri));
            }
        }
        for (key, value) in &start.attributes {
            if restamp.is_some() && key == "schemaVersion" {
                continue;
            }
            out.push_attribute((key.as_str(), value.as_str()));
        }
        if let Some(target) = restamp {
            out.push_attribute(("schemaVersion", target.as_str()));
        }
        writer.write_event(Event::Start(out)).map_err(write_err)
    }
}

/// Consumes events through the end tag matching the already-consumed start.
fn skip_subtree(reader: &mut TagReader<'_>) -> Result<(), XmlError> {
    let mut depth = 1usize;
    loop {
        match reader.next_event()? {
            TagEvent::Start(_) => depth += 1,
            TagEvent::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            TagEvent::Text(_) => {}
            TagEvent::Eof => {
                return Err(XmlError::Parse(quick_xml::Error::from(
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "document ended inside a skipped element",
                    ),
                )))
            }
        }
    }
}

fn write_err(error: impl Into<quick_xml::Error>) -> XmlError {
    XmlError::Parse(error.into())
}
