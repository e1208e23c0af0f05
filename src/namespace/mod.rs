//! The two-tier namespace binding store threaded through a conversion.
//!
//! Document-level bindings are collected while the header is processed and
//! stay fixed for the rest of the conversion. Event-level bindings come from
//! an event-local `@context` or a locally scoped declaration, take precedence
//! while their event is live, and are cleared at the event boundary.

use indexmap::IndexMap;

use epcis_codecs::xml::names;

/// Prefix-to-URI bindings split into a document scope and an event scope.
#[derive(Debug, Clone, Default)]
pub struct NamespaceContext {
    document_ns: IndexMap<String, String>,
    event_ns: IndexMap<String, String>,
}

impl NamespaceContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `prefix` to `uri` in the document scope. Re-binding an existing
    /// prefix overwrites it; the last write wins.
    pub fn put_document(&mut self, uri: impl Into<String>, prefix: impl Into<String>) {
        self.document_ns.insert(prefix.into(), uri.into());
    }

    /// Binds `prefix` to `uri` in the event scope.
    ///
    /// A standard prefix can never be shadowed; such attempts are dropped.
    pub fn put_event(&mut self, uri: impl Into<String>, prefix: impl Into<String>) {
        let prefix = prefix.into();
        if names::is_standard_prefix(&prefix) {
            return;
        }
        self.event_ns.insert(prefix, uri.into());
    }

    /// Resolves `prefix`, consulting the event scope before the document
    /// scope.
    pub fn resolve_prefix(&self, prefix: &str) -> Option<&str> {
        self.event_ns
            .get(prefix)
            .or_else(|| self.document_ns.get(prefix))
            .map(String::as_str)
    }

    /// The union of both scopes, with event bindings taking precedence.
    pub fn all_bindings(&self) -> IndexMap<&str, &str> {
        let mut bindings: IndexMap<&str, &str> = self
            .document_ns
            .iter()
            .map(|(p, u)| (p.as_str(), u.as_str()))
            .collect();
        for (prefix, uri) in &self.event_ns {
            bindings.insert(prefix.as_str(), uri.as_str());
        }
        bindings
    }

    /// The event-scope bindings only.
    pub fn event_view(&self) -> impl Iterator<Item = (&str, &str)> {
        self.event_ns.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }

    /// The document-scope bindings only.
    pub fn document_view(&self) -> impl Iterator<Item = (&str, &str)> {
        self.document_ns
            .iter()
            .map(|(p, u)| (p.as_str(), u.as_str()))
    }

    /// True when no event-scope binding is live.
    pub fn event_is_empty(&self) -> bool {
        self.event_ns.is_empty()
    }

    /// The URI-to-prefix view used when writing the tag form. Every prefix
    /// bound to a URI is preserved; duplicates are not coalesced.
    pub fn uri_to_prefix_view(&self) -> IndexMap<&str, Vec<&str>> {
        let mut view: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for (prefix, uri) in self.all_bindings() {
            view.entry(uri).or_default().push(prefix);
        }
        view
    }

    /// Clears the event scope only.
    pub fn reset_event(&mut self) {
        self.event_ns.clear();
    }

    /// Creates a child context whose document scope is a snapshot of this
    /// context's and whose event scope starts empty. Mutating the child never
    /// affects this context.
    pub fn scope_for_event(&self) -> NamespaceContext {
        NamespaceContext {
            document_ns: self.document_ns.clone(),
            event_ns: IndexMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_scope_takes_precedence_and_resets() {
        let mut ctx = NamespaceContext::new();
        ctx.put_document("https://example.com/doc", "ex");
        ctx.put_event("https://example.com/event", "ex");

        assert_eq!(ctx.resolve_prefix("ex"), Some("https://example.com/event"));
        assert_eq!(ctx.all_bindings()["ex"], "https://example.com/event");

        ctx.reset_event();
        assert_eq!(ctx.resolve_prefix("ex"), Some("https://example.com/doc"));
        assert!(ctx.event_is_empty());
    }

    #[test]
    fn standard_prefixes_cannot_be_shadowed() {
        let mut ctx = NamespaceContext::new();
        for prefix in ["epcis", "epcisq", "xsi", "cbvmda", "xml"] {
            ctx.put_event("https://example.com/shadow", prefix);
            assert_eq!(ctx.resolve_prefix(prefix), None, "prefix {prefix}");
        }
        // The document scope accepts them; only event shadowing is refused.
        ctx.put_document("urn:epcglobal:epcis:xsd:2", "epcis");
        assert_eq!(
            ctx.resolve_prefix("epcis"),
            Some("urn:epcglobal:epcis:xsd:2")
        );
    }

    #[test]
    fn document_rebinding_last_write_wins() {
        let mut ctx = NamespaceContext::new();
        ctx.put_document("https://example.com/a", "p");
        ctx.put_document("https://example.com/b", "p");
        assert_eq!(ctx.resolve_prefix("p"), Some("https://example.com/b"));
    }

    #[test]
    fn scoped_child_is_isolated() {
        let mut parent = NamespaceContext::new();
        parent.put_document("https://example.com/doc", "ex");

        let mut child = parent.scope_for_event();
        child.put_event("https://example.com/child", "local");
        child.put_document("https://example.com/more", "extra");

        assert_eq!(child.resolve_prefix("ex"), Some("https://example.com/doc"));
        assert_eq!(parent.resolve_prefix("local"), None);
        assert_eq!(parent.resolve_prefix("extra"), None);
        assert!(parent.event_is_empty());
    }

    #[test]
    fn uri_view_preserves_every_prefix() {
        let mut ctx = NamespaceContext::new();
        ctx.put_document("https://example.com/shared", "a");
        ctx.put_document("https://example.com/shared", "b");
        ctx.put_event("https://example.com/shared", "c");

        let view = ctx.uri_to_prefix_view();
        assert_eq!(view["https://example.com/shared"], vec!["a", "b", "c"]);
    }
}
