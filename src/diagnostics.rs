//! The side channel for recoverable conditions and exit reporting.

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::ErrorKind;

/// A recoverable condition observed during a conversion. Diagnostics never
/// terminate the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// The document `@context` appeared after the event list began and the
    /// source was re-read from the top once.
    LateContextRestarted,
    /// A late `@context` was detected but the source offers no restart; the
    /// conversion proceeded with the bindings discovered so far.
    LateContextUnavailable,
    /// An extension field used a prefix with no known binding.
    UndeclaredPrefix {
        /// The unresolved prefix.
        prefix: String,
    },
    /// An unrecognized but non-fatal extension was carried through verbatim.
    UnknownExtension {
        /// The extension's field or element name.
        name: String,
    },
    /// A blocking stage ran on the subscription task because no worker pool
    /// was configured.
    MissingWorkerPool,
}

/// How a conversion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCondition {
    /// The output stream completed.
    Completed,
    /// The stream terminated with a fatal error of the given kind.
    Failed(ErrorKind),
    /// The consumer went away before the terminal signal.
    Cancelled,
}

#[derive(Debug, Default)]
struct Inner {
    warnings: Vec<Diagnostic>,
    exit: Option<ExitCondition>,
}

/// Shared collector for one conversion's diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    inner: Arc<Mutex<Inner>>,
}

impl Diagnostics {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a recoverable condition.
    pub fn record(&self, diagnostic: Diagnostic) {
        warn!(message = "recoverable conversion condition", ?diagnostic);
        if let Ok(mut inner) = self.inner.lock() {
            inner.warnings.push(diagnostic);
        }
    }

    /// A snapshot of the recorded warnings.
    pub fn warnings(&self) -> Vec<Diagnostic> {
        self.inner
            .lock()
            .map(|inner| inner.warnings.clone())
            .unwrap_or_default()
    }

    /// Records the terminal condition. The first record wins; later calls are
    /// ignored.
    pub fn set_exit(&self, exit: ExitCondition) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.exit.get_or_insert(exit);
        }
    }

    /// The terminal condition, once the stream has ended.
    pub fn exit(&self) -> Option<ExitCondition> {
        self.inner.lock().ok().and_then(|inner| inner.exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_exit_wins() {
        let diagnostics = Diagnostics::new();
        diagnostics.set_exit(ExitCondition::Failed(ErrorKind::MalformedInput));
        diagnostics.set_exit(ExitCondition::Completed);
        assert_eq!(
            diagnostics.exit(),
            Some(ExitCondition::Failed(ErrorKind::MalformedInput))
        );
    }

    #[test]
    fn warnings_accumulate() {
        let diagnostics = Diagnostics::new();
        diagnostics.record(Diagnostic::LateContextRestarted);
        diagnostics.record(Diagnostic::UndeclaredPrefix {
            prefix: "ex".into(),
        });
        assert_eq!(diagnostics.warnings().len(), 2);
    }
}
