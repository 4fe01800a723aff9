//! Node-scoped diagnostics.

use kfuse_types::NodeId;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Observational sink; recording never changes behavior.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, severity: Severity, node: Option<NodeId>, message: &str);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, severity: Severity, node: Option<NodeId>, message: &str) {
        let node = node.map(|n| n.get());
        match severity {
            Severity::Debug => tracing::debug!(node, "{message}"),
            Severity::Info => tracing::info!(node, "{message}"),
            Severity::Warning => tracing::warn!(node, "{message}"),
            Severity::Error | Severity::Critical => tracing::error!(node, ?severity, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagEvent {
    pub severity: Severity,
    pub node: Option<NodeId>,
    pub message: String,
}

/// Keeps every event in memory, and forwards to `tracing` as well.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DiagEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagEvent> {
        self.events.lock().clone()
    }

    pub fn count_for(&self, node: NodeId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.node == Some(node))
            .count()
    }

    pub fn count_at_least(&self, severity: Severity) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.severity >= severity)
            .count()
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&self, severity: Severity, node: Option<NodeId>, message: &str) {
        TracingSink.record(severity, node, message);
        self.events.lock().push(DiagEvent {
            severity,
            node,
            message: message.to_owned(),
        });
    }
}
