//! The event carrier and the seam to the event-model collaborator.
//!
//! The core never inspects event internals; it sees an event only through the
//! [`EventModel`] operations plus the sequence number and scoped namespace
//! context it stamps onto each event before handing it to the normalizer.

mod generic;
pub mod normalize;

use std::{fmt, sync::Arc};

use epcis_codecs::decoding::format::{EventKind, ObjectValue};
use epcis_codecs::xml::XmlElement;

use crate::namespace::NamespaceContext;

pub use generic::GenericEventModel;

/// A failure inside the event-model collaborator.
#[derive(Debug)]
pub struct ModelError {
    message: String,
}

impl ModelError {
    /// Creates an error from anything printable.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ModelError {}

/// One EPCIS event as it moves through a pipeline.
///
/// The payload is owned by the event-model collaborator; the core attaches a
/// 1-based sequence number and the event-scoped namespace context before the
/// normalizer runs.
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    node: ObjectValue,
    sequence: u64,
    context: NamespaceContext,
    undeclared_prefixes: Vec<String>,
}

impl Event {
    /// Creates an unstamped event around the collaborator's payload.
    pub fn new(kind: EventKind, node: ObjectValue) -> Self {
        Self {
            kind,
            node,
            sequence: 0,
            context: NamespaceContext::new(),
            undeclared_prefixes: Vec::new(),
        }
    }

    /// The event variant.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The collaborator-owned payload.
    pub fn node(&self) -> &ObjectValue {
        &self.node
    }

    /// Mutable access for the normalizer.
    pub fn node_mut(&mut self) -> &mut ObjectValue {
        &mut self.node
    }

    /// The 1-based position in input order; zero before stamping.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The event-scoped namespace context.
    pub fn context(&self) -> &NamespaceContext {
        &self.context
    }

    /// Stamps the sequence number and transfers ownership of the scoped
    /// context onto this event.
    pub fn stamp(&mut self, sequence: u64, context: NamespaceContext) {
        self.sequence = sequence;
        self.context = context;
    }

    /// Prefixes used by the payload that no live binding resolves.
    pub fn undeclared_prefixes(&self) -> &[String] {
        &self.undeclared_prefixes
    }

    pub(crate) fn set_undeclared_prefixes(&mut self, prefixes: Vec<String>) {
        self.undeclared_prefixes = prefixes;
    }
}

/// The event-model collaborator seam.
///
/// Unmarshal operations read the namespace bindings of the event being parsed
/// through the task-local unmarshal scope (see [`with_unmarshal_scope`]);
/// converters set the scope around every unmarshal call.
pub trait EventModel: Send + Sync {
    /// Parses an event from a tag-form element subtree.
    fn unmarshal_tag(&self, fragment: &XmlElement) -> Result<Event, ModelError>;

    /// Parses an event from one object node.
    fn unmarshal_object(&self, node: &ObjectValue) -> Result<Event, ModelError>;

    /// Writes an event as a tag-form element subtree.
    fn marshal_tag(&self, event: &Event) -> Result<XmlElement, ModelError>;

    /// Writes an event as an object node (without the event-local `@context`,
    /// which the converter injects).
    fn marshal_object(&self, event: &Event) -> Result<ObjectValue, ModelError>;
}

tokio::task_local! {
    static UNMARSHAL_SCOPE: Arc<NamespaceContext>;
}

/// Runs `f` with the task-local unmarshal scope set to `context`.
///
/// The scope is cleared on every exit path, normal or panicking, because the
/// guard lives on the stack of this call.
pub fn with_unmarshal_scope<F, T>(context: Arc<NamespaceContext>, f: F) -> T
where
    F: FnOnce() -> T,
{
    UNMARSHAL_SCOPE.sync_scope(context, f)
}

/// The namespace context of the event currently being unmarshaled, when
/// called from within [`with_unmarshal_scope`].
pub fn current_unmarshal_scope() -> Option<Arc<NamespaceContext>> {
    UNMARSHAL_SCOPE.try_with(Arc::clone).ok()
}
