//! Hooks into buffered file content and change notification.

use bitflags::bitflags;
use kfuse_types::NodeId;
use parking_lot::Mutex;

bitflags! {
    /// What changed about a node, as reported to watchers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangeHint: u32 {
        const WRITE    = 1 << 0;
        const EXTEND   = 1 << 1;
        const TRUNCATE = 1 << 2;
        const ATTRIB   = 1 << 3;
    }
}

/// Buffered content held for nodes (page cache equivalent).
pub trait ContentCache: Send + Sync {
    /// Push dirty content for `[0, size)` to the daemon and drop it.
    fn flush_and_invalidate(&self, node: NodeId, size: u64);

    /// Push dirty content to the daemon and keep it cached.
    fn sync(&self, node: NodeId);

    fn set_size(&self, node: NodeId, size: u64);
}

pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, node: NodeId, hint: ChangeHint);
}

/// Does nothing; the default when no content cache or watchers exist.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ContentCache for NoopHooks {
    fn flush_and_invalidate(&self, _node: NodeId, _size: u64) {}

    fn sync(&self, _node: NodeId) {}

    fn set_size(&self, _node: NodeId, _size: u64) {}
}

impl ChangeNotifier for NoopHooks {
    fn notify(&self, _node: NodeId, _hint: ChangeHint) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Flushed { node: NodeId, size: u64 },
    Synced { node: NodeId },
    Resized { node: NodeId, size: u64 },
    Notified { node: NodeId, hint: ChangeHint },
}

/// Records every hook invocation in order.
#[derive(Debug, Default)]
pub struct ChangeRecorder {
    events: Mutex<Vec<ChangeEvent>>,
}

impl ChangeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    pub fn flushes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, ChangeEvent::Flushed { .. }))
            .count()
    }

    pub fn syncs(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, ChangeEvent::Synced { .. }))
            .count()
    }

    /// Union of every hint raised for `node`.
    pub fn hints_for(&self, node: NodeId) -> ChangeHint {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ChangeEvent::Notified { node: n, hint } if *n == node => Some(*hint),
                _ => None,
            })
            .fold(ChangeHint::empty(), |acc, h| acc | h)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ContentCache for ChangeRecorder {
    fn flush_and_invalidate(&self, node: NodeId, size: u64) {
        self.events.lock().push(ChangeEvent::Flushed { node, size });
    }

    fn sync(&self, node: NodeId) {
        self.events.lock().push(ChangeEvent::Synced { node });
    }

    fn set_size(&self, node: NodeId, size: u64) {
        self.events.lock().push(ChangeEvent::Resized { node, size });
    }
}

impl ChangeNotifier for ChangeRecorder {
    fn notify(&self, node: NodeId, hint: ChangeHint) {
        self.events.lock().push(ChangeEvent::Notified { node, hint });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_unions_hints() {
        let rec = ChangeRecorder::new();
        let n = NodeId::from(4);
        rec.notify(n, ChangeHint::WRITE | ChangeHint::EXTEND);
        rec.notify(n, ChangeHint::ATTRIB);
        rec.notify(NodeId::from(5), ChangeHint::TRUNCATE);
        rec.flush_and_invalidate(n, 10);
        assert_eq!(
            rec.hints_for(n),
            ChangeHint::WRITE | ChangeHint::EXTEND | ChangeHint::ATTRIB
        );
        assert_eq!(rec.flushes(), 1);
        rec.clear();
        assert!(rec.events().is_empty());
    }
}
