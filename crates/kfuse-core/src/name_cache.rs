//! `(parent, name) -> child` associations learned from lookups and
//! creations.

use std::collections::HashMap;

use kfuse_types::NodeId;
use parking_lot::RwLock;

use crate::session::{MountFlags, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameLookup {
    Hit(NodeId),
    /// The daemon said the name does not exist.
    Negative,
    Miss,
}

#[derive(Debug)]
pub struct NameCache {
    enabled: bool,
    negative: bool,
    /// `None` marks a negative entry.
    entries: RwLock<HashMap<(NodeId, String), Option<NodeId>>>,
}

impl NameCache {
    pub fn new(session: &Session) -> Self {
        Self::with_flags(session.flags())
    }

    pub fn with_flags(flags: MountFlags) -> Self {
        let enabled = !flags.contains(MountFlags::NO_VNCACHE);
        Self {
            enabled,
            negative: enabled && flags.contains(MountFlags::NEGATIVE_VNCACHE),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, parent: NodeId, name: &str, child: NodeId) {
        if self.enabled {
            self.entries
                .write()
                .insert((parent, name.to_owned()), Some(child));
        }
    }

    /// Remember that `name` does not exist under `parent`. Returns false
    /// when negative caching is off.
    pub fn insert_negative(&self, parent: NodeId, name: &str) -> bool {
        if !self.negative {
            return false;
        }
        self.entries.write().insert((parent, name.to_owned()), None);
        true
    }

    pub fn lookup(&self, parent: NodeId, name: &str) -> NameLookup {
        match self.entries.read().get(&(parent, name.to_owned())) {
            Some(Some(child)) => NameLookup::Hit(*child),
            Some(None) => NameLookup::Negative,
            None => NameLookup::Miss,
        }
    }

    pub fn remove(&self, parent: NodeId, name: &str) -> bool {
        self.entries
            .write()
            .remove(&(parent, name.to_owned()))
            .is_some()
    }

    /// Drop every entry naming `node` as the child, and every entry
    /// beneath it as the parent. Returns how many entries went away.
    pub fn purge_node(&self, node: NodeId) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(parent, _), child| *parent != node && *child != Some(node));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
