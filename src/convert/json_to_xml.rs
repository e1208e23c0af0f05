//! The object-to-tag converter.
//!
//! This stage is truly streaming: at most one event is in memory at a time,
//! and the input is never read twice except through the source's restart
//! facility, which serves the late-`@context` recovery path.

use std::sync::Arc;

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::{pin_mut, Stream, StreamExt};
use tokio_util::codec::Decoder;

use epcis_codecs::decoding::format::{HeaderFields, NodeKind, ObjectValue};
use epcis_codecs::decoding::framing::{ContextScanOutcome, ContextScanner, JsonNodeDecoder};
use epcis_codecs::xml::{names, FragmentWriter};

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{ConvertError, Result};
use crate::model::{normalize::Normalizer, with_unmarshal_scope, Event, EventModel};
use crate::namespace::NamespaceContext;
use crate::sources::ByteSource;

use super::xml_to_json::{object_footer, object_header, serialize_event};
use super::{DocFlavor, DocumentMeta};

/// Resolves a referenced external context URL into namespace bindings.
///
/// The resolver is a collaborator: deployments that dereference context URLs
/// plug one in; the default recognizes the published EPCIS context (whose
/// prefixes are pre-declared) and treats everything else as unknown.
pub trait ContextResolver: Send + Sync {
    /// The bindings contributed by `url`, or `None` when the URL is not
    /// resolvable offline.
    fn resolve(&self, url: &str) -> Option<Vec<(String, String)>>;
}

/// The stock offline resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContextResolver;

impl ContextResolver for DefaultContextResolver {
    fn resolve(&self, url: &str) -> Option<Vec<(String, String)>> {
        (url == names::EPCIS_CONTEXT_URL || url.contains("epcis-context"))
            .then(Vec::new)
    }
}

/// A node parsed off the object stream.
enum Parsed {
    Header(Box<DocumentMeta>, NamespaceContext),
    Event(Event),
}

/// The object-to-tag conversion stage.
pub struct JsonToXml {
    model: Arc<dyn EventModel>,
    normalizer: Normalizer,
    diagnostics: Diagnostics,
    resolver: Arc<dyn ContextResolver>,
}

impl JsonToXml {
    /// Creates the stage.
    pub fn new(
        model: Arc<dyn EventModel>,
        normalizer: Normalizer,
        diagnostics: Diagnostics,
        resolver: Arc<dyn ContextResolver>,
    ) -> Self {
        Self {
            model,
            normalizer,
            diagnostics,
            resolver,
        }
    }

    /// Converts an object-form source into a stream of tag-form byte pieces:
    /// header, one fragment per event, footer.
    pub fn convert(self, source: ByteSource) -> impl Stream<Item = Result<Bytes>> + Send {
        let model = Arc::clone(&self.model);
        try_stream! {
            let parsed = self.parse(source);
            pin_mut!(parsed);

            let mut flavor: Option<DocFlavor> = None;
            while let Some(item) = parsed.next().await {
                match item? {
                    Parsed::Header(meta, context) => {
                        flavor = Some(meta.flavor);
                        yield Bytes::from(tag_header(&meta, &context));
                    }
                    Parsed::Event(event) => {
                        let sequence = event.sequence();
                        let fragment = marshal_event_fragment(model.as_ref(), &event)
                            .map_err(|error| ConvertError::marshal(sequence, error))?;
                        let mut piece = Vec::with_capacity(fragment.len() + 1);
                        piece.push(b'\n');
                        piece.extend_from_slice(&fragment);
                        yield Bytes::from(piece);
                    }
                }
            }
            if let Some(flavor) = flavor {
                yield Bytes::from_static(tag_footer(flavor).as_bytes());
            }
        }
    }

    /// Re-serializes an object-form source back into the object form,
    /// applying the normalizer per event. This is the identity path when a
    /// user normalizer is configured.
    pub fn reserialize(self, source: ByteSource) -> impl Stream<Item = Result<Bytes>> + Send {
        let model = Arc::clone(&self.model);
        try_stream! {
            let parsed = self.parse(source);
            pin_mut!(parsed);

            let mut flavor: Option<DocFlavor> = None;
            let mut first = true;
            while let Some(item) = parsed.next().await {
                match item? {
                    Parsed::Header(meta, context) => {
                        flavor = Some(meta.flavor);
                        yield Bytes::from(object_header(&meta, &context));
                    }
                    Parsed::Event(event) => {
                        let sequence = event.sequence();
                        let body = serialize_event(model.as_ref(), &event)
                            .map_err(|error| ConvertError::marshal(sequence, error))?;
                        let mut piece = Vec::with_capacity(body.len() + 1);
                        if !first {
                            piece.push(b',');
                        }
                        first = false;
                        piece.extend_from_slice(&body);
                        yield Bytes::from(piece);
                    }
                }
            }
            if let Some(flavor) = flavor {
                yield Bytes::from_static(object_footer(flavor));
            }
        }
    }

    /// Parses an object-form source into a stream of stamped events,
    /// dropping the header.
    pub fn events(self, source: ByteSource) -> impl Stream<Item = Result<Event>> + Send {
        self.parse(source).filter_map(|item| async {
            match item {
                Ok(Parsed::Event(event)) => Some(Ok(event)),
                Ok(Parsed::Header(..)) => None,
                Err(error) => Some(Err(error)),
            }
        })
    }

    /// The streaming core: frames nodes off the source, emits the header
    /// facts once, then one stamped, normalized event at a time.
    fn parse(self, source: ByteSource) -> impl Stream<Item = Result<Parsed>> + Send {
        try_stream! {
            let (stream, retry) = source.into_parts();
            pin_mut!(stream);

            let mut decoder = JsonNodeDecoder::new();
            let mut buf = BytesMut::new();
            let mut ended = false;
            let mut header_done = false;
            let mut document_context = NamespaceContext::new();
            let mut sequence: u64 = 0;

            loop {
                // Pump the decoder, reading more input only when it stalls.
                let frame = loop {
                    if ended {
                        match decoder.decode_eof(&mut buf).map_err(ConvertError::from)? {
                            Some(frame) => break Some(frame),
                            None => break None,
                        }
                    }
                    match decoder.decode(&mut buf).map_err(ConvertError::from)? {
                        Some(frame) => break Some(frame),
                        None => match stream.next().await {
                            Some(chunk) => buf.extend_from_slice(&chunk?),
                            None => ended = true,
                        },
                    }
                };
                let Some(frame) = frame else { break };

                let node = ObjectValue::from_slice(&frame).map_err(|error| {
                    ConvertError::malformed(format!("invalid object node: {error}"))
                })?;

                if !header_done {
                    header_done = true;
                    let mut fields = HeaderFields::from_node(&node);

                    if fields.context.is_none() {
                        match &retry {
                            Some(retry) => {
                                if let Some(found) =
                                    scan_for_late_context(retry.open()).await?
                                {
                                    fields.context = ObjectValue::from_slice(&found).ok();
                                    self.diagnostics.record(Diagnostic::LateContextRestarted);
                                }
                            }
                            None => {
                                self.diagnostics.record(Diagnostic::LateContextUnavailable);
                            }
                        }
                    }

                    if let Some(context_value) = &fields.context {
                        bind_context_value(
                            context_value,
                            self.resolver.as_ref(),
                            &mut document_context,
                            false,
                            &self.diagnostics,
                        );
                    }

                    let meta = header_meta(&fields);
                    yield Parsed::Header(Box::new(meta), document_context.clone());
                    continue;
                }

                ensure_event_node(&node)?;

                sequence += 1;
                let mut scoped = document_context.scope_for_event();
                if let Some(local_context) = node.get("@context") {
                    bind_context_value(
                        local_context,
                        self.resolver.as_ref(),
                        &mut scoped,
                        true,
                        &self.diagnostics,
                    );
                }

                let model = Arc::clone(&self.model);
                let scope = Arc::new(scoped.clone());
                let unmarshaled = with_unmarshal_scope(scope, || model.unmarshal_object(&node));
                let mut event = unmarshaled
                    .map_err(|error| ConvertError::unmarshal(sequence, error.to_string()))?;

                for prefix in event.undeclared_prefixes().to_vec() {
                    self.diagnostics
                        .record(Diagnostic::UndeclaredPrefix { prefix });
                }

                event.stamp(sequence, scoped);
                let event = (self.normalizer)(event, &document_context);
                yield Parsed::Event(event);
            }
        }
    }
}

fn ensure_event_node(node: &ObjectValue) -> Result<()> {
    match NodeKind::classify(node) {
        NodeKind::Event(_) => Ok(()),
        _ => Err(ConvertError::unsupported(
            "unknown event type in event list",
        )),
    }
}

/// Drives the restart sequence through a [`ContextScanner`] once.
async fn scan_for_late_context(
    retry_stream: crate::sources::ChunkStream,
) -> Result<Option<Bytes>> {
    pin_mut!(retry_stream);
    let mut scanner = ContextScanner::new();
    while let Some(chunk) = retry_stream.next().await {
        match scanner.push(&chunk?) {
            ContextScanOutcome::NeedMore => {}
            ContextScanOutcome::Found(bytes) => return Ok(Some(bytes)),
            ContextScanOutcome::NotFound => return Ok(None),
        }
    }
    Ok(None)
}

/// Folds a `@context` value into namespace bindings: strings resolve through
/// the resolver, objects contribute their prefix members directly.
fn bind_context_value(
    value: &ObjectValue,
    resolver: &dyn ContextResolver,
    context: &mut NamespaceContext,
    event_scope: bool,
    diagnostics: &Diagnostics,
) {
    match value {
        ObjectValue::String(url) => match resolver.resolve(url) {
            Some(bindings) => {
                for (prefix, uri) in bindings {
                    if event_scope {
                        context.put_event(uri, prefix);
                    } else {
                        context.put_document(uri, prefix);
                    }
                }
            }
            None => diagnostics.record(Diagnostic::UnknownExtension { name: url.clone() }),
        },
        ObjectValue::Array(items) => {
            for item in items {
                bind_context_value(item, resolver, context, event_scope, diagnostics);
            }
        }
        ObjectValue::Object(members) => {
            for (prefix, uri) in members {
                if prefix.starts_with('@') {
                    continue;
                }
                if let ObjectValue::String(uri) = uri {
                    if event_scope {
                        context.put_event(uri.clone(), prefix.clone());
                    } else {
                        context.put_document(uri.clone(), prefix.clone());
                    }
                }
            }
        }
        _ => {}
    }
}

fn header_meta(fields: &HeaderFields) -> DocumentMeta {
    let context_text = fields
        .context
        .as_ref()
        .map(ObjectValue::to_json)
        .unwrap_or_default();
    DocumentMeta {
        flavor: if fields.is_query() {
            DocFlavor::Query
        } else {
            DocFlavor::Regular
        },
        schema_version: fields.schema_version.clone(),
        creation: fields.creation.clone(),
        subscription_id: fields.subscription_id.clone(),
        query_name: fields.query_name.clone(),
        declares_cbvmda: context_text.contains("cbvmda")
            || context_text.contains(names::CBVMDA_NS),
    }
}

fn attr_escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

/// Builds the tag header through the event-list opener: XML declaration,
/// root element with its namespace declarations and document attributes, the
/// body opener, and the query envelope when applicable.
pub(crate) fn tag_header(meta: &DocumentMeta, context: &NamespaceContext) -> String {
    let mut header = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    match meta.flavor {
        DocFlavor::Regular => {
            header.push_str("<epcis:EPCISDocument xmlns:epcis=\"");
            header.push_str(names::EPCIS_2_NS);
        }
        DocFlavor::Query => {
            header.push_str("<epcisq:EPCISQueryDocument xmlns:epcisq=\"");
            header.push_str(names::EPCIS_QUERY_2_NS);
        }
    }
    header.push_str("\" xmlns:xsi=\"");
    header.push_str(names::XSI_NS);
    header.push('"');

    if meta.declares_cbvmda {
        header.push_str(" xmlns:cbvmda=\"");
        header.push_str(names::CBVMDA_NS);
        header.push('"');
    }
    for (prefix, uri) in context.document_view() {
        if names::is_writable_prefix(prefix) && !names::is_standard_uri(uri) {
            header.push_str(" xmlns:");
            header.push_str(prefix);
            header.push_str("=\"");
            header.push_str(&attr_escape(uri));
            header.push('"');
        }
    }

    header.push_str(" schemaVersion=\"");
    header.push_str(&attr_escape(
        meta.schema_version.as_deref().unwrap_or("2.0"),
    ));
    header.push('"');
    if let Some((name, value)) = &meta.creation {
        header.push(' ');
        header.push_str(name);
        header.push_str("=\"");
        header.push_str(&attr_escape(value));
        header.push('"');
    }
    header.push_str(">\n  <EPCISBody>\n");

    match meta.flavor {
        DocFlavor::Regular => header.push_str("    <EventList>"),
        DocFlavor::Query => {
            header.push_str("    <QueryResults>\n");
            if let Some(subscription) = &meta.subscription_id {
                header.push_str("      <subscriptionID>");
                header.push_str(&attr_escape(subscription));
                header.push_str("</subscriptionID>\n");
            }
            if let Some(query_name) = &meta.query_name {
                header.push_str("      <queryName>");
                header.push_str(&attr_escape(query_name));
                header.push_str("</queryName>\n");
            }
            header.push_str("      <resultsBody>\n        <EventList>");
        }
    }
    header
}

/// The footer matching [`tag_header`].
pub(crate) const fn tag_footer(flavor: DocFlavor) -> &'static str {
    match flavor {
        DocFlavor::Regular => "\n    </EventList>\n  </EPCISBody>\n</epcis:EPCISDocument>",
        DocFlavor::Query => {
            "\n        </EventList>\n      </resultsBody>\n    </QueryResults>\n  </EPCISBody>\n</epcisq:EPCISQueryDocument>"
        }
    }
}

/// Marshals one event and writes it with the embedded (non-root-namespace
/// re-declaring) writer, declaring the event-scoped bindings on the fragment
/// root.
pub(crate) fn marshal_event_fragment(
    model: &dyn EventModel,
    event: &Event,
) -> Result<Vec<u8>, String> {
    let element = model.marshal_tag(event).map_err(|error| error.to_string())?;
    let bindings: Vec<(String, String)> = event
        .context()
        .event_view()
        .map(|(prefix, uri)| (prefix.to_owned(), uri.to_owned()))
        .collect();
    FragmentWriter::embedded()
        .write(&element, &bindings)
        .map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use crate::model::{normalize::identity_normalizer, GenericEventModel};

    use super::*;

    fn stage() -> JsonToXml {
        JsonToXml::new(
            Arc::new(GenericEventModel::new()),
            identity_normalizer(),
            Diagnostics::new(),
            Arc::new(DefaultContextResolver),
        )
    }

    async fn convert_to_string(stage: JsonToXml, doc: &str) -> String {
        let source = ByteSource::from_bytes(Bytes::from(doc.as_bytes().to_vec()));
        let pieces: Vec<_> = stage.convert(source).collect().await;
        let mut out = Vec::new();
        for piece in pieces {
            out.extend_from_slice(&piece.unwrap());
        }
        String::from_utf8(out).unwrap()
    }

    const MINIMAL: &str = r#"{"@context":["https://ref.gs1.org/standards/epcis/epcis-context.jsonld"],
        "type":"EPCISDocument","schemaVersion":"2.0","creationDate":"2023-01-01T00:00:00Z",
        "epcisBody":{"eventList":[
            {"type":"ObjectEvent","eventTime":"2023-01-01T00:00:00Z",
             "eventTimeZoneOffset":"+00:00","action":"OBSERVE",
             "epcList":["urn:epc:id:sgtin:0614141.107346.2017"]}]}}"#;

    #[tokio::test]
    async fn minimal_document_produces_tag_form() {
        let out = convert_to_string(stage(), MINIMAL).await;

        assert!(out.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(out.contains("EPCISDocument"));
        assert!(out.contains("<ObjectEvent>"));
        assert!(out.contains("urn:epc:id:sgtin:0614141.107346.2017"));
        assert!(out.contains("creationDate=\"2023-01-01T00:00:00Z\""));
        assert!(out.trim_end().ends_with("</epcis:EPCISDocument>"));
    }

    #[tokio::test]
    async fn query_documents_carry_the_envelope() {
        let doc = r#"{"@context":["https://ref.gs1.org/standards/epcis/epcis-context.jsonld"],
            "type":"EPCISQueryDocument","schemaVersion":"2.0","createdAt":"2023-05-01T10:00:00Z",
            "epcisBody":{"queryResults":{"subscriptionID":"sub-9","queryName":"SimpleEventQuery",
            "resultsBody":{"eventList":[{"type":"ObjectEvent","action":"OBSERVE"}]}}}}"#;
        let out = convert_to_string(stage(), doc).await;

        assert!(out.contains("EPCISQueryDocument"));
        assert!(out.contains("<QueryResults>"));
        assert!(out.contains("<subscriptionID>sub-9</subscriptionID>"));
        assert!(out.contains("<queryName>SimpleEventQuery</queryName>"));
        assert!(out.contains("createdAt=\"2023-05-01T10:00:00Z\""));
        assert!(out.trim_end().ends_with("</epcisq:EPCISQueryDocument>"));
    }

    #[tokio::test]
    async fn custom_context_prefixes_are_declared_at_the_root() {
        let doc = r#"{"@context":["https://ref.gs1.org/standards/epcis/epcis-context.jsonld",
            {"prx":"https://example.com/custom"}],
            "type":"EPCISDocument","schemaVersion":"2.0",
            "epcisBody":{"eventList":[{"type":"ObjectEvent","prx:field":"v"}]}}"#;
        let out = convert_to_string(stage(), doc).await;

        assert!(out.contains("xmlns:prx=\"https://example.com/custom\""));
        assert!(out.contains("<prx:field>v</prx:field>"));
    }

    #[tokio::test]
    async fn late_context_is_recovered_through_restart() {
        let doc = r#"{"type":"EPCISDocument","schemaVersion":"2.0",
            "epcisBody":{"eventList":[{"type":"ObjectEvent","prx:field":"v"}]},
            "@context":[{"prx":"https://example.com/custom"}]}"#;
        let diagnostics = Diagnostics::new();
        let stage = JsonToXml::new(
            Arc::new(GenericEventModel::new()),
            identity_normalizer(),
            diagnostics.clone(),
            Arc::new(DefaultContextResolver),
        );
        let out = convert_to_string(stage, doc).await;

        assert!(out.contains("xmlns:prx=\"https://example.com/custom\""));
        assert!(diagnostics
            .warnings()
            .contains(&Diagnostic::LateContextRestarted));
    }

    #[tokio::test]
    async fn event_local_context_stays_on_the_event() {
        let doc = r#"{"@context":["https://ref.gs1.org/standards/epcis/epcis-context.jsonld"],
            "type":"EPCISDocument","schemaVersion":"2.0",
            "epcisBody":{"eventList":[
                {"type":"ObjectEvent","@context":{"loc":"https://example.com/local"},
                 "loc:field":"x"}]}}"#;
        let out = convert_to_string(stage(), doc).await;

        // Declared on the event fragment, not promoted to the root.
        let (header, events) = out.split_once("<EventList>").unwrap();
        assert!(!header.contains("https://example.com/local"));
        assert!(events.contains("xmlns:loc=\"https://example.com/local\""));
    }

    #[tokio::test]
    async fn streaming_sequence_numbers_are_stamped() {
        let doc = r#"{"@context":[],"type":"EPCISDocument","schemaVersion":"2.0",
            "epcisBody":{"eventList":[
                {"type":"ObjectEvent","action":"ADD"},
                {"type":"AggregationEvent","action":"ADD"},
                {"type":"AssociationEvent","action":"ADD"}]}}"#;
        let source = ByteSource::from_bytes(Bytes::from(doc.as_bytes().to_vec()));
        let events: Vec<_> = stage().events(source).collect().await;
        let sequences: Vec<u64> = events
            .into_iter()
            .map(|event| event.unwrap().sequence())
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }
}
