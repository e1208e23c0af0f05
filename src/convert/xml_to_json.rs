//! The tag-to-object converter.
//!
//! The whole input is buffered before parsing (a pull reader cannot hand
//! partial-document state to a demand-driven consumer safely), then events
//! are unmarshaled, stamped, normalized, and serialized one at a time.

use std::sync::Arc;

use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;

use epcis_codecs::decoding::format::{EventKind, ObjectValue};
use epcis_codecs::xml::{names, TagEvent, TagReader, XmlElement};

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{ConvertError, Result};
use crate::model::{normalize::Normalizer, with_unmarshal_scope, Event, EventModel};
use crate::namespace::NamespaceContext;

use super::{DocFlavor, DocumentMeta};

/// One-shot document-flavor detector.
///
/// The transition fires exactly once, on the first start element whose local
/// name contains "document"; descendants of an SBDH envelope (for example
/// `DocumentIdentification`) can never re-fire it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlavorDetect {
    NotYetDetected,
    Detected(DocFlavor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingHeaderText {
    SubscriptionId,
    QueryName,
}

/// Pull parser over a buffered tag-form document, yielding stamped events.
pub struct TagDocParser<'a> {
    reader: TagReader<'a>,
    context: NamespaceContext,
    meta: DocumentMeta,
    detect: FlavorDetect,
    pending_text: Option<PendingHeaderText>,
    sequence: u64,
    in_event_list: bool,
    finished: bool,
    model: Arc<dyn EventModel>,
    normalizer: Normalizer,
    diagnostics: Diagnostics,
}

impl<'a> TagDocParser<'a> {
    /// Creates a parser over `bytes`.
    pub fn new(
        bytes: &'a [u8],
        model: Arc<dyn EventModel>,
        normalizer: Normalizer,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            reader: TagReader::from_bytes(bytes),
            context: NamespaceContext::new(),
            meta: DocumentMeta::empty(),
            detect: FlavorDetect::NotYetDetected,
            pending_text: None,
            sequence: 0,
            in_event_list: false,
            finished: false,
            model,
            normalizer,
            diagnostics,
        }
    }

    /// The conversion's namespace context.
    pub fn context(&self) -> &NamespaceContext {
        &self.context
    }

    /// Consumes the header region up to the event list, capturing the
    /// document flavor, namespaces, attributes, and query fields.
    pub fn read_header(&mut self) -> Result<DocumentMeta> {
        loop {
            match self.reader.next_event()? {
                TagEvent::Start(start) => {
                    if self.detect == FlavorDetect::NotYetDetected
                        && start
                            .local_name()
                            .to_ascii_lowercase()
                            .contains("document")
                    {
                        let flavor = if start.local_name() == "EPCISQueryDocument" {
                            DocFlavor::Query
                        } else {
                            DocFlavor::Regular
                        };
                        self.detect = FlavorDetect::Detected(flavor);
                        self.meta.flavor = flavor;
                        self.capture_root(&start);
                        continue;
                    }
                    match start.local_name() {
                        "subscriptionID" => {
                            self.pending_text = Some(PendingHeaderText::SubscriptionId)
                        }
                        "queryName" => self.pending_text = Some(PendingHeaderText::QueryName),
                        "EventList" => {
                            self.in_event_list = true;
                            return Ok(self.meta.clone());
                        }
                        _ => {}
                    }
                }
                TagEvent::Text(text) => {
                    match self.pending_text.take() {
                        Some(PendingHeaderText::SubscriptionId) => {
                            self.meta.subscription_id = Some(text)
                        }
                        Some(PendingHeaderText::QueryName) => self.meta.query_name = Some(text),
                        None => {}
                    }
                }
                TagEvent::End(_) => self.pending_text = None,
                TagEvent::Eof => {
                    // A document without an event list is all header.
                    self.finished = true;
                    return Ok(self.meta.clone());
                }
            }
        }
    }

    fn capture_root(&mut self, start: &epcis_codecs::xml::ElementStart) {
        for (prefix, uri) in &start.declarations {
            if uri == names::CBVMDA_NS {
                self.meta.declares_cbvmda = true;
            }
            self.context.put_document(uri.clone(), prefix.clone());
        }
        self.meta.schema_version = start.attribute("schemaVersion").map(str::to_owned);
        self.meta.creation = ["creationDate", "createdAt"].iter().find_map(|name| {
            start
                .attribute(name)
                .map(|value| ((*name).to_owned(), value.to_owned()))
        });
    }

    /// The next stamped, normalized event, or `None` after the event list
    /// closes.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        if !self.in_event_list || self.finished {
            return Ok(None);
        }
        loop {
            match self.reader.next_event()? {
                TagEvent::Start(start) => {
                    let local = start.local_name();
                    // 1.x wraps newer event kinds in extension elements.
                    if local == "extension" || local == "baseExtension" {
                        continue;
                    }
                    if EventKind::from_name(local).is_none() {
                        return Err(ConvertError::unsupported(format!(
                            "unknown event type {:?} in event list",
                            start.name
                        )));
                    }

                    self.sequence += 1;
                    let sequence = self.sequence;
                    for (prefix, uri) in &start.declarations {
                        if !prefix.is_empty() && !names::is_standard_uri(uri) {
                            self.context.put_event(uri.clone(), prefix.clone());
                        }
                    }
                    let fragment = self.reader.read_subtree(start)?;
                    collect_nested_declarations(&fragment, &mut self.context);

                    let scope = Arc::new(self.context.clone());
                    let model = Arc::clone(&self.model);
                    let unmarshaled =
                        with_unmarshal_scope(scope, || model.unmarshal_tag(&fragment));
                    let mut event = unmarshaled
                        .map_err(|error| ConvertError::unmarshal(sequence, error.to_string()))?;

                    for prefix in event.undeclared_prefixes().to_vec() {
                        self.diagnostics
                            .record(Diagnostic::UndeclaredPrefix { prefix });
                    }

                    let mut scoped = self.context.scope_for_event();
                    let event_bindings: Vec<(String, String)> = self
                        .context
                        .event_view()
                        .map(|(p, u)| (p.to_owned(), u.to_owned()))
                        .collect();
                    for (prefix, uri) in event_bindings {
                        scoped.put_event(uri, prefix);
                    }
                    event.stamp(sequence, scoped);
                    let event = (self.normalizer)(event, &self.context);

                    self.context.reset_event();
                    return Ok(Some(event));
                }
                TagEvent::End(name) => {
                    if name.rsplit(':').next() == Some("EventList") {
                        self.finished = true;
                        return Ok(None);
                    }
                }
                TagEvent::Text(_) => {}
                TagEvent::Eof => {
                    return Err(ConvertError::malformed(
                        "document ended before the event list was closed",
                    ))
                }
            }
        }
    }
}

fn collect_nested_declarations(fragment: &XmlElement, context: &mut NamespaceContext) {
    for child in fragment.child_elements() {
        for (prefix, uri) in &child.declarations {
            if !prefix.is_empty() && !names::is_standard_uri(uri) {
                context.put_event(uri.clone(), prefix.clone());
            }
        }
        collect_nested_declarations(child, context);
    }
}

/// The tag-to-object conversion stage.
pub struct XmlToJson {
    model: Arc<dyn EventModel>,
    normalizer: Normalizer,
    diagnostics: Diagnostics,
}

impl XmlToJson {
    /// Creates the stage.
    pub fn new(model: Arc<dyn EventModel>, normalizer: Normalizer, diagnostics: Diagnostics) -> Self {
        Self {
            model,
            normalizer,
            diagnostics,
        }
    }

    /// Converts a buffered tag-form document into a stream of object-form
    /// byte pieces: header, comma-separated events, footer.
    pub fn convert(self, bytes: Bytes) -> impl Stream<Item = Result<Bytes>> + Send {
        try_stream! {
            let mut parser = TagDocParser::new(
                bytes.as_ref(),
                Arc::clone(&self.model),
                Arc::clone(&self.normalizer),
                self.diagnostics.clone(),
            );
            let meta = parser.read_header()?;
            yield Bytes::from(object_header(&meta, parser.context()));

            let mut first = true;
            while let Some(event) = parser.next_event()? {
                let sequence = event.sequence();
                let body = serialize_event(self.model.as_ref(), &event)
                    .map_err(|error| ConvertError::marshal(sequence, error))?;
                let mut piece = Vec::with_capacity(body.len() + 1);
                if !first {
                    piece.push(b',');
                }
                first = false;
                piece.extend_from_slice(&body);
                yield Bytes::from(piece);
            }

            yield Bytes::from_static(object_footer(meta.flavor));
        }
    }

    /// Parses a buffered tag-form document into a stream of stamped events.
    pub fn events(self, bytes: Bytes) -> impl Stream<Item = Result<Event>> + Send {
        try_stream! {
            let mut parser = TagDocParser::new(
                bytes.as_ref(),
                Arc::clone(&self.model),
                Arc::clone(&self.normalizer),
                self.diagnostics.clone(),
            );
            parser.read_header()?;
            while let Some(event) = parser.next_event()? {
                yield event;
            }
        }
    }
}

fn json_quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_owned())
}

/// Builds the object header through the event-list opener.
pub(crate) fn object_header(meta: &DocumentMeta, context: &NamespaceContext) -> String {
    let mut entries = vec![json_quote(names::EPCIS_CONTEXT_URL)];
    for (prefix, uri) in context.document_view() {
        if names::is_writable_prefix(prefix) && !names::is_standard_uri(uri) {
            entries.push(format!("{{{}:{}}}", json_quote(prefix), json_quote(uri)));
        }
    }

    let doc_type = if meta.flavor.is_regular() {
        "EPCISDocument"
    } else {
        "EPCISQueryDocument"
    };
    let mut header = format!(
        "{{\"@context\":[{}],\"type\":\"{doc_type}\",\"schemaVersion\":\"2.0\"",
        entries.join(",")
    );
    if let Some((name, value)) = &meta.creation {
        header.push(',');
        header.push_str(&json_quote(name));
        header.push(':');
        header.push_str(&json_quote(value));
    }

    match meta.flavor {
        DocFlavor::Regular => header.push_str(",\"epcisBody\":{\"eventList\":["),
        DocFlavor::Query => {
            header.push_str(",\"epcisBody\":{\"queryResults\":{");
            if let Some(subscription) = &meta.subscription_id {
                header.push_str("\"subscriptionID\":");
                header.push_str(&json_quote(subscription));
                header.push(',');
            }
            if let Some(query_name) = &meta.query_name {
                header.push_str("\"queryName\":");
                header.push_str(&json_quote(query_name));
                header.push(',');
            }
            header.push_str("\"resultsBody\":{\"eventList\":[");
        }
    }
    header
}

/// The closing delimiters matching the header: three for a regular document,
/// five for a query document.
pub(crate) const fn object_footer(flavor: DocFlavor) -> &'static [u8] {
    match flavor {
        DocFlavor::Regular => b"]}}",
        DocFlavor::Query => b"]}}}}",
    }
}

/// Serializes one event, injecting the event-local `@context` only when the
/// event scope carries bindings.
pub(crate) fn serialize_event(model: &dyn EventModel, event: &Event) -> Result<Vec<u8>, String> {
    let mut node = model
        .marshal_object(event)
        .map_err(|error| error.to_string())?;

    if !event.context().event_is_empty() {
        let bindings = event
            .context()
            .event_view()
            .map(|(prefix, uri)| {
                ObjectValue::Object(vec![(
                    prefix.to_owned(),
                    ObjectValue::String(uri.to_owned()),
                )])
            })
            .collect();
        if let ObjectValue::Object(members) = &mut node {
            members.insert(0, ("@context".to_owned(), ObjectValue::Array(bindings)));
        }
    }

    serde_json::to_vec(&node).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use indoc::indoc;

    use crate::model::{normalize::identity_normalizer, GenericEventModel};

    use super::*;

    const REGULAR_12: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <epcis:EPCISDocument xmlns:epcis="urn:epcglobal:epcis:xsd:1"
            xmlns:prx="https://example.com/custom"
            schemaVersion="1.2" creationDate="2023-03-15T08:00:00Z">
          <EPCISHeader>
            <sbdh:StandardBusinessDocumentHeader
                xmlns:sbdh="http://www.unece.org/cefact/namespaces/StandardBusinessDocumentHeader">
              <sbdh:DocumentIdentification>
                <sbdh:Standard>EPCglobal</sbdh:Standard>
              </sbdh:DocumentIdentification>
            </sbdh:StandardBusinessDocumentHeader>
          </EPCISHeader>
          <EPCISBody>
            <EventList>
              <ObjectEvent>
                <eventTime>2023-03-15T08:00:00Z</eventTime>
                <action>OBSERVE</action>
                <epcList><epc>urn:epc:id:sgtin:0614141.107346.2017</epc></epcList>
              </ObjectEvent>
              <ObjectEvent>
                <eventTime>2023-03-15T09:00:00Z</eventTime>
                <action>ADD</action>
              </ObjectEvent>
            </EventList>
          </EPCISBody>
        </epcis:EPCISDocument>
    "#};

    fn stage() -> XmlToJson {
        XmlToJson::new(
            Arc::new(GenericEventModel::new()),
            identity_normalizer(),
            Diagnostics::new(),
        )
    }

    async fn convert_to_string(doc: &str) -> String {
        let pieces: Vec<_> = stage()
            .convert(Bytes::from(doc.as_bytes().to_vec()))
            .collect()
            .await;
        let mut out = Vec::new();
        for piece in pieces {
            out.extend_from_slice(&piece.unwrap());
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn sbdh_does_not_refire_flavor_detection() {
        let out = convert_to_string(REGULAR_12).await;
        let value: serde_json::Value = serde_json::from_str(&out).expect("balanced output");

        assert_eq!(value["type"], "EPCISDocument");
        assert!(out.matches('{').count() == out.matches('}').count());
        assert!(!out.contains("queryResults"));
        assert_eq!(value["creationDate"], "2023-03-15T08:00:00Z");

        let events = value["epcisBody"]["eventList"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "ObjectEvent");
    }

    #[tokio::test]
    async fn custom_prefixes_reach_the_merged_context() {
        let out = convert_to_string(REGULAR_12).await;
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();

        let context = value["@context"].as_array().unwrap();
        assert!(context
            .iter()
            .any(|entry| entry.get("prx").is_some()));
        // Infrastructure namespaces never surface as context entries.
        assert!(!out.contains("StandardBusinessDocumentHeader\""));
        assert!(!out.contains("urn:epcglobal:epcis:xsd:1"));
    }

    #[tokio::test]
    async fn query_documents_keep_their_envelope() {
        let doc = indoc! {r#"
            <epcisq:EPCISQueryDocument xmlns:epcisq="urn:epcglobal:epcis-query:xsd:2"
                schemaVersion="2.0" createdAt="2023-05-01T10:00:00Z">
              <EPCISBody>
                <epcisq:QueryResults>
                  <queryName>SimpleEventQuery</queryName>
                  <subscriptionID>sub-42</subscriptionID>
                  <resultsBody>
                    <EventList>
                      <ObjectEvent>
                        <action>OBSERVE</action>
                      </ObjectEvent>
                    </EventList>
                  </resultsBody>
                </epcisq:QueryResults>
              </EPCISBody>
            </epcisq:EPCISQueryDocument>
        "#};
        let out = convert_to_string(doc).await;
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();

        assert_eq!(value["type"], "EPCISQueryDocument");
        assert_eq!(value["createdAt"], "2023-05-01T10:00:00Z");
        let results = &value["epcisBody"]["queryResults"];
        assert_eq!(results["subscriptionID"], "sub-42");
        assert_eq!(results["queryName"], "SimpleEventQuery");
        assert_eq!(
            results["resultsBody"]["eventList"][0]["type"],
            "ObjectEvent"
        );
    }

    #[tokio::test]
    async fn event_sequence_numbers_follow_input_order() {
        let stage = stage();
        let events: Vec<_> = stage
            .events(Bytes::from(REGULAR_12.as_bytes().to_vec()))
            .collect()
            .await;
        let sequences: Vec<u64> = events
            .into_iter()
            .map(|event| event.unwrap().sequence())
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn unknown_event_type_fails_unsupported() {
        let doc = r#"<epcis:EPCISDocument xmlns:epcis="urn:epcglobal:epcis:xsd:2"
            schemaVersion="2.0"><EPCISBody><EventList>
            <MysteryEvent/></EventList></EPCISBody></epcis:EPCISDocument>"#;
        let pieces: Vec<_> = stage()
            .convert(Bytes::from(doc.as_bytes().to_vec()))
            .collect()
            .await;
        let error = pieces
            .into_iter()
            .find_map(|piece| piece.err())
            .expect("conversion must fail");
        assert!(matches!(error, ConvertError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn event_local_declarations_produce_event_context() {
        let doc = r#"<epcis:EPCISDocument xmlns:epcis="urn:epcglobal:epcis:xsd:2"
            schemaVersion="2.0"><EPCISBody><EventList>
            <ObjectEvent xmlns:loc="https://example.com/local">
              <action>OBSERVE</action>
              <loc:custom>x</loc:custom>
            </ObjectEvent></EventList></EPCISBody></epcis:EPCISDocument>"#;
        let out = convert_to_string(doc).await;
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();

        let event = &value["epcisBody"]["eventList"][0];
        assert!(event.get("@context").is_some());
        assert_eq!(event["loc:custom"], "x");
        // The document-level context does not absorb the event-local prefix.
        let doc_context = value["@context"].as_array().unwrap();
        assert!(!doc_context.iter().any(|entry| entry.get("loc").is_some()));
    }
}
