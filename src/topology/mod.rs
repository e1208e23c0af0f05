//! The router: selects and composes a conversion pipeline from the
//! specification, applies identifier normalization, offloads blocking stages
//! to the worker pool, and re-frames the output into fixed-size chunks.

mod pipe;

use std::{
    pin::Pin,
    sync::{Arc, Once},
    task::{ready, Context, Poll},
};

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::{pin_mut, stream::BoxStream, Stream, StreamExt};
use pin_project::{pin_project, pinned_drop};
use tracing::warn;

use epcis_codecs::chunking::{ChunkedStream, ChunkerConfig};

use crate::convert::{
    json_to_xml::{marshal_event_fragment, tag_footer, tag_header, ContextResolver, JsonToXml},
    sniff_tag_revision,
    xml_to_json::{TagDocParser, XmlToJson},
    DefaultContextResolver,
};
use crate::diagnostics::{Diagnostic, Diagnostics, ExitCondition};
use crate::error::{ConvertError, Result};
use crate::model::{
    normalize::{digital_link_normalizer, urn_normalizer, Normalizer},
    Event, EventModel, GenericEventModel,
};
use crate::sources::{ByteSource, ChunkStream};
use crate::spec::{ConversionSpec, Format, ResolvedSpec, Revision};
use crate::transform::{RevisionTransformer, TransformFlags};

pub use pipe::{spawn_through_pipe, PIPE_CAPACITY};

/// A stream of stamped events, for consumers that want events rather than
/// serialized bytes.
pub type EventStream = BoxStream<'static, Result<Event>>;

/// The pool used for blocking stages.
#[derive(Debug, Clone)]
pub enum WorkerPool {
    /// Blocking work is dispatched to this runtime's blocking thread pool.
    Runtime(tokio::runtime::Handle),
    /// Blocking work executes on the caller's thread. Accepted, but it
    /// defeats blocking isolation.
    Direct,
}

/// The conversion router.
///
/// A router is immutable; the `with_*` builders return a sibling router with
/// one setting replaced. Cloning is cheap.
#[derive(Clone)]
pub struct Router {
    chunk_size: usize,
    pool: Option<WorkerPool>,
    normalizer: Option<Normalizer>,
    model: Arc<dyn EventModel>,
    resolver: Arc<dyn ContextResolver>,
    flags: TransformFlags,
    pool_warning: Arc<Once>,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            chunk_size: epcis_codecs::chunking::DEFAULT_CHUNK_SIZE,
            pool: None,
            normalizer: None,
            model: Arc::new(GenericEventModel::new()),
            resolver: Arc::new(DefaultContextResolver),
            flags: TransformFlags::keep_all(),
            pool_warning: Arc::new(Once::new()),
        }
    }
}

impl Router {
    /// Creates a router with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the output chunk size. Validated when a conversion is built.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Attaches the pool used for blocking stages.
    pub fn with_worker_pool(mut self, pool: WorkerPool) -> Self {
        if matches!(pool, WorkerPool::Direct) {
            warn!(
                message = "a direct pool executes blocking stages on the caller thread and defeats blocking isolation"
            );
        }
        self.pool = Some(pool);
        self
    }

    /// Overrides the default identifier normalizer.
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Replaces the event-model collaborator.
    pub fn with_event_model(mut self, model: Arc<dyn EventModel>) -> Self {
        self.model = model;
        self
    }

    /// Replaces the external-context resolver.
    pub fn with_context_resolver(mut self, resolver: Arc<dyn ContextResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the down-conversion feature flags, honored when a conversion
    /// requests legacy identifier normalization.
    pub fn with_transform_flags(mut self, flags: TransformFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Builds the whole-document conversion described by `spec`.
    ///
    /// Pair errors are raised eagerly when both revisions are known; with
    /// autodetection they surface as the stream's terminal failure.
    pub fn convert(&self, source: ByteSource, spec: ConversionSpec) -> Result<Conversion> {
        let chunker = ChunkerConfig::new(self.chunk_size).build()?;
        if let Some(from_rev) = spec.from_rev {
            spec.resolve(from_rev)?;
        }
        let diagnostics = Diagnostics::new();
        let pieces = self.clone().piece_stream(source, spec, diagnostics.clone());
        let chunked = ChunkedStream::new(pieces, chunker);
        let stream = ExitTracked::new(chunked, diagnostics.clone()).boxed();
        Ok(Conversion {
            stream,
            content_type: spec.to_fmt.media_type(),
            diagnostics,
        })
    }

    /// Builds the per-event stream described by `spec`.
    pub fn convert_to_events(&self, source: ByteSource, spec: ConversionSpec) -> Result<EventStream> {
        if let Some(from_rev) = spec.from_rev {
            spec.resolve(from_rev)?;
        }
        let diagnostics = Diagnostics::new();
        let router = self.clone();
        let stream = match spec.from_fmt {
            Format::Tag => try_stream! {
                let bytes = collect_stream(source.into_stream()).await?;
                let detected = sniff_tag_revision(&bytes)?;
                let resolved = spec.resolve(detected)?;
                let stage = XmlToJson::new(
                    Arc::clone(&router.model),
                    router.select_normalizer(&resolved),
                    diagnostics.clone(),
                );
                let events = stage.events(bytes);
                pin_mut!(events);
                while let Some(event) = events.next().await {
                    yield event?;
                }
            }
            .boxed(),
            Format::Object => {
                let resolved = spec.resolve(spec.from_rev.unwrap_or(Revision::V2_0))?;
                let stage = JsonToXml::new(
                    Arc::clone(&router.model),
                    router.select_normalizer(&resolved),
                    diagnostics,
                    Arc::clone(&router.resolver),
                );
                stage.events(source).boxed()
            }
        };
        Ok(stream)
    }

    /// The normalizer for a resolved pipeline: the user-supplied one wins;
    /// otherwise legacy targets use the URN form and everything else the
    /// Digital Link form.
    fn select_normalizer(&self, resolved: &ResolvedSpec) -> Normalizer {
        if let Some(normalizer) = &self.normalizer {
            return Arc::clone(normalizer);
        }
        if resolved.to_rev.is_legacy() {
            urn_normalizer()
        } else {
            digital_link_normalizer()
        }
    }

    fn flags_for(&self, resolved: &ResolvedSpec) -> TransformFlags {
        if resolved.normalize_to_legacy_ids {
            self.flags
        } else {
            TransformFlags::omit_all()
        }
    }

    async fn run_transform(
        &self,
        bytes: Bytes,
        from: Revision,
        to: Revision,
        flags: TransformFlags,
        diagnostics: &Diagnostics,
    ) -> Result<Bytes> {
        match &self.pool {
            Some(WorkerPool::Runtime(handle)) => handle
                .spawn_blocking(move || {
                    RevisionTransformer::shared().transform(&bytes, from, to, flags)
                })
                .await
                .map_err(|error| {
                    ConvertError::transform(format!("worker task failed: {error}"))
                })?,
            Some(WorkerPool::Direct) => {
                RevisionTransformer::shared().transform(&bytes, from, to, flags)
            }
            None => {
                self.pool_warning.call_once(|| {
                    warn!(
                        message = "no worker pool is configured; the blocking revision transform runs on the subscription task"
                    );
                });
                diagnostics.record(Diagnostic::MissingWorkerPool);
                RevisionTransformer::shared().transform(&bytes, from, to, flags)
            }
        }
    }

    /// The piece-level pipeline per the routing decision table; pieces are
    /// re-framed by the caller's chunker.
    fn piece_stream(
        self,
        source: ByteSource,
        spec: ConversionSpec,
        diagnostics: Diagnostics,
    ) -> impl Stream<Item = Result<Bytes>> + Send {
        try_stream! {
            match spec.from_fmt {
                Format::Tag => {
                    let bytes = collect_stream(source.into_stream()).await?;
                    let detected = sniff_tag_revision(&bytes)?;
                    let resolved = spec.resolve(detected)?;
                    let normalizer = self.select_normalizer(&resolved);
                    let flags = self.flags_for(&resolved);

                    match resolved.to_fmt {
                        Format::Object => {
                            let bytes = if resolved.from_rev.is_legacy() {
                                self.run_transform(
                                    bytes,
                                    resolved.from_rev,
                                    Revision::V2_0,
                                    flags,
                                    &diagnostics,
                                )
                                .await?
                            } else {
                                bytes
                            };
                            let stage = XmlToJson::new(
                                Arc::clone(&self.model),
                                normalizer,
                                diagnostics.clone(),
                            );
                            let out = stage.convert(bytes);
                            pin_mut!(out);
                            while let Some(piece) = out.next().await {
                                yield piece?;
                            }
                        }
                        Format::Tag => {
                            let rewritten = remarshal_tag_document(
                                &bytes,
                                Arc::clone(&self.model),
                                normalizer,
                                diagnostics.clone(),
                            )?;
                            if resolved.to_rev == Revision::V2_0 {
                                yield rewritten;
                            } else {
                                yield self
                                    .run_transform(
                                        rewritten,
                                        Revision::V2_0,
                                        resolved.to_rev,
                                        flags,
                                        &diagnostics,
                                    )
                                    .await?;
                            }
                        }
                    }
                }
                Format::Object => {
                    let resolved = spec.resolve(spec.from_rev.unwrap_or(Revision::V2_0))?;
                    let flags = self.flags_for(&resolved);

                    match resolved.to_fmt {
                        Format::Tag => {
                            let stage = JsonToXml::new(
                                Arc::clone(&self.model),
                                self.select_normalizer(&resolved),
                                diagnostics.clone(),
                                Arc::clone(&self.resolver),
                            );
                            if resolved.to_rev == Revision::V2_0 {
                                let out = stage.convert(source);
                                pin_mut!(out);
                                while let Some(piece) = out.next().await {
                                    yield piece?;
                                }
                            } else {
                                // Chain the streaming stage into the blocking
                                // one through the bounded pipe.
                                let piped = spawn_through_pipe(
                                    self.pool.as_ref(),
                                    stage.convert(source),
                                    PIPE_CAPACITY,
                                );
                                let bytes = collect_stream(piped).await?;
                                yield self
                                    .run_transform(
                                        bytes,
                                        Revision::V2_0,
                                        resolved.to_rev,
                                        flags,
                                        &diagnostics,
                                    )
                                    .await?;
                            }
                        }
                        Format::Object => match &self.normalizer {
                            None => {
                                let stream = source.into_stream();
                                pin_mut!(stream);
                                while let Some(chunk) = stream.next().await {
                                    yield chunk?;
                                }
                            }
                            Some(user_normalizer) => {
                                let stage = JsonToXml::new(
                                    Arc::clone(&self.model),
                                    Arc::clone(user_normalizer),
                                    diagnostics.clone(),
                                    Arc::clone(&self.resolver),
                                );
                                let out = stage.reserialize(source);
                                pin_mut!(out);
                                while let Some(piece) = out.next().await {
                                    yield piece?;
                                }
                            }
                        },
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("chunk_size", &self.chunk_size)
            .field("pool", &self.pool)
            .field("has_normalizer", &self.normalizer.is_some())
            .finish()
    }
}

/// Re-serializes a buffered tag document at revision 2.0: parse events,
/// marshal events, fresh header and footer.
fn remarshal_tag_document(
    bytes: &[u8],
    model: Arc<dyn EventModel>,
    normalizer: Normalizer,
    diagnostics: Diagnostics,
) -> Result<Bytes> {
    let mut parser = TagDocParser::new(bytes, Arc::clone(&model), normalizer, diagnostics);
    let mut meta = parser.read_header()?;
    meta.schema_version = Some(Revision::V2_0.as_str().to_owned());

    let mut out: Vec<u8> = tag_header(&meta, parser.context()).into_bytes();
    while let Some(event) = parser.next_event()? {
        let sequence = event.sequence();
        let fragment = marshal_event_fragment(model.as_ref(), &event)
            .map_err(|error| ConvertError::marshal(sequence, error))?;
        out.push(b'\n');
        out.extend_from_slice(&fragment);
    }
    out.extend_from_slice(tag_footer(meta.flavor).as_bytes());
    Ok(Bytes::from(out))
}

/// Drains a chunk stream into one buffer.
pub(crate) async fn collect_stream(stream: ChunkStream) -> Result<Bytes> {
    pin_mut!(stream);
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// A built conversion: the output chunk stream plus its result metadata.
pub struct Conversion {
    stream: ChunkStream,
    content_type: &'static str,
    diagnostics: Diagnostics,
}

impl Conversion {
    /// The content type of the output serialization.
    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// The diagnostics handle; warnings accumulate as the stream is driven,
    /// and the exit condition is recorded at the terminal signal.
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.clone()
    }

    /// The demand-driven output stream.
    pub fn into_stream(self) -> ChunkStream {
        self.stream
    }

    /// Drives the conversion to completion, collecting the output.
    pub async fn into_bytes(self) -> Result<Bytes> {
        collect_stream(self.stream).await
    }
}

impl std::fmt::Debug for Conversion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversion")
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Records the exit condition of the wrapped stream: completed, failed with
/// the error's kind, or cancelled when dropped before the terminal signal.
#[pin_project(PinnedDrop)]
struct ExitTracked<S> {
    #[pin]
    inner: S,
    diagnostics: Diagnostics,
    terminal: bool,
}

impl<S> ExitTracked<S> {
    fn new(inner: S, diagnostics: Diagnostics) -> Self {
        Self {
            inner,
            diagnostics,
            terminal: false,
        }
    }
}

impl<S> Stream for ExitTracked<S>
where
    S: Stream<Item = Result<Bytes>>,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.terminal {
            return Poll::Ready(None);
        }
        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(error)) => {
                *this.terminal = true;
                this.diagnostics
                    .set_exit(ExitCondition::Failed(error.kind()));
                Poll::Ready(Some(Err(error)))
            }
            None => {
                *this.terminal = true;
                this.diagnostics.set_exit(ExitCondition::Completed);
                Poll::Ready(None)
            }
        }
    }
}

#[pinned_drop]
impl<S> PinnedDrop for ExitTracked<S> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if !*this.terminal {
            this.diagnostics.set_exit(ExitCondition::Cancelled);
        }
    }
}
