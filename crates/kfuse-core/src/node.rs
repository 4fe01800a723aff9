//! Local node records and the table that owns them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use kfuse_types::NodeId;
use parking_lot::{Condvar, Mutex};

use crate::attr::AttrState;
use crate::handle::HandleSlots;

// ── Node kind ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl NodeKind {
    /// Kind encoded in the `S_IFMT` bits of a mode, if recognized.
    pub fn from_mode(mode: u32) -> Option<Self> {
        let fmt = mode & libc::S_IFMT as u32;
        let kind = if fmt == libc::S_IFREG as u32 {
            NodeKind::Regular
        } else if fmt == libc::S_IFDIR as u32 {
            NodeKind::Directory
        } else if fmt == libc::S_IFLNK as u32 {
            NodeKind::Symlink
        } else if fmt == libc::S_IFBLK as u32 {
            NodeKind::BlockDevice
        } else if fmt == libc::S_IFCHR as u32 {
            NodeKind::CharDevice
        } else if fmt == libc::S_IFIFO as u32 {
            NodeKind::Fifo
        } else if fmt == libc::S_IFSOCK as u32 {
            NodeKind::Socket
        } else {
            return None;
        };
        Some(kind)
    }
}

// ── Node ────────────────────────────────────────────────────────────────────

/// Local state for one daemon node.
///
/// Handle slots and attributes have separate locks so that an attribute
/// read never waits behind an open exchange.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    parent: AtomicU64,
    generation: u64,
    lookups: AtomicU64,
    direct_io: AtomicBool,
    pub(crate) handles: Mutex<HandleSlots>,
    /// Signalled whenever a slot leaves the `Opening` state.
    pub(crate) handles_changed: Condvar,
    pub(crate) attrs: Mutex<AttrState>,
}

impl Node {
    pub fn new(id: NodeId, kind: NodeKind, parent: NodeId, generation: u64) -> Self {
        Self {
            id,
            kind,
            parent: AtomicU64::new(parent.get()),
            generation,
            lookups: AtomicU64::new(0),
            direct_io: AtomicBool::new(false),
            handles: Mutex::new(HandleSlots::default()),
            handles_changed: Condvar::new(),
            attrs: Mutex::new(AttrState::default()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == NodeKind::Symlink
    }

    pub fn parent(&self) -> NodeId {
        NodeId::from(self.parent.load(Ordering::Relaxed))
    }

    pub fn set_parent(&self, parent: NodeId) {
        self.parent.store(parent.get(), Ordering::Relaxed);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lookups the daemon has handed out for this node and not yet been
    /// told to forget.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub(crate) fn add_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn take_lookups(&self) -> u64 {
        self.lookups.swap(0, Ordering::Relaxed)
    }

    /// Daemon granted page-cache bypass on an open of this node.
    pub fn is_direct_io(&self) -> bool {
        self.direct_io.load(Ordering::Relaxed)
    }

    pub fn set_direct_io(&self, on: bool) {
        self.direct_io.store(on, Ordering::Relaxed);
    }
}

// ── Node table ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: DashMap<NodeId, Arc<Node>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.get(&id).map(|n| Arc::clone(n.value()))
    }

    /// Insert the node if absent, and count one more lookup against it.
    ///
    /// An existing entry keeps its kind; the caller checks it.
    pub fn register(&self, id: NodeId, kind: NodeKind, parent: NodeId, generation: u64) -> Arc<Node> {
        let node = self
            .nodes
            .entry(id)
            .or_insert_with(|| Arc::new(Node::new(id, kind, parent, generation)))
            .value()
            .clone();
        node.set_parent(parent);
        node.add_lookup();
        node
    }

    /// Insert the session root; it carries no lookup count.
    pub fn insert_root(&self) -> Arc<Node> {
        self.nodes
            .entry(NodeId::ROOT)
            .or_insert_with(|| Arc::new(Node::new(NodeId::ROOT, NodeKind::Directory, NodeId::NULL, 0)))
            .value()
            .clone()
    }

    pub fn remove(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.remove(&id).map(|(_, n)| n)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
