//! Cached node attributes and their reconciliation with daemon replies.

use std::sync::Arc;

use kfuse_proto::ops::{Attr, XtimesOut};
use kfuse_proto::Opcode;
use kfuse_types::{Gid, NodeId, Timespec, Uid};

use crate::clock::Clock;
use crate::dispatch::{Dispatcher, RequestContext};
use crate::error::{FuseError, Result};
use crate::node::{Node, NodeKind};
use crate::notify::{ChangeHint, ChangeNotifier, ContentCache};
use crate::session::{MountFlags, Session};

/// Bytes per unit of `Attr::blocks`.
const BLOCK_UNIT: u64 = 512;

/// Local view of a node's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrSnapshot {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub crtime: Option<Timespec>,
    pub bkuptime: Option<Timespec>,
    pub mode: u32,
    pub kind: NodeKind,
    pub nlink: u32,
    pub uid: Uid,
    pub gid: Gid,
    pub rdev: u32,
    pub flags: u32,
    pub iosize: u32,
    /// Allocated bytes; only tracked for sparse sessions.
    pub data_alloc: Option<u64>,
}

impl AttrSnapshot {
    pub fn from_wire(attr: &Attr, session: &Session) -> Result<Self> {
        let kind = NodeKind::from_mode(attr.mode).ok_or_else(|| {
            FuseError::Protocol(format!("unrecognized file type in mode {:o}", attr.mode))
        })?;
        Ok(Self {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime(),
            mtime: attr.mtime(),
            ctime: attr.ctime(),
            crtime: attr.crtime(),
            bkuptime: None,
            mode: attr.mode,
            kind,
            nlink: attr.nlink,
            uid: Uid::from(attr.uid),
            gid: Gid::from(attr.gid),
            rdev: attr.rdev,
            flags: attr.flags,
            iosize: session.iosize(),
            data_alloc: session
                .is_sparse()
                .then(|| attr.blocks.saturating_mul(BLOCK_UNIT)),
        })
    }

    /// What the root reports once the daemon is gone: an empty,
    /// read-only directory owned by the daemon credential.
    pub fn dead_root(session: &Session) -> Self {
        let cred = session.daemon_cred();
        Self {
            ino: NodeId::ROOT.get(),
            size: 0,
            blocks: 0,
            atime: Timespec::ZERO,
            mtime: Timespec::ZERO,
            ctime: Timespec::ZERO,
            crtime: None,
            bkuptime: None,
            mode: libc::S_IFDIR as u32 | 0o555,
            kind: NodeKind::Directory,
            nlink: 2,
            uid: cred.uid,
            gid: cred.gid,
            rdev: 0,
            flags: 0,
            iosize: session.iosize(),
            data_alloc: None,
        }
    }

    pub fn extended_times(&self) -> ExtendedTimes {
        ExtendedTimes {
            crtime: self.crtime,
            bkuptime: self.bkuptime,
        }
    }
}

/// Create and backup times, which the primary attribute reply may omit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedTimes {
    pub crtime: Option<Timespec>,
    pub bkuptime: Option<Timespec>,
}

impl ExtendedTimes {
    pub fn is_complete(&self) -> bool {
        self.crtime.is_some() && self.bkuptime.is_some()
    }
}

// ── Merge ───────────────────────────────────────────────────────────────────

/// Where a merged field takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    Candidate,
    Current,
    /// Candidate when it carries a value, else current.
    CandidateIfSet,
}

/// Per-field-group policy for [`merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    /// `size` and `blocks`.
    pub size: FieldPolicy,
    /// `atime`, `mtime` and `ctime`.
    pub times: FieldPolicy,
    /// `crtime` and `bkuptime`.
    pub xtimes: FieldPolicy,
    /// Type, mode, ownership, link count and the rest.
    pub identity: FieldPolicy,
    pub data_alloc: FieldPolicy,
}

impl MergePolicy {
    /// A fresh daemon reply: everything from the candidate, except values
    /// the reply may simply not carry.
    pub const fn refresh() -> Self {
        Self {
            size: FieldPolicy::Candidate,
            times: FieldPolicy::Candidate,
            xtimes: FieldPolicy::CandidateIfSet,
            identity: FieldPolicy::Candidate,
            data_alloc: FieldPolicy::CandidateIfSet,
        }
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::refresh()
    }
}

trait FieldValue: Copy {
    fn is_set(&self) -> bool {
        true
    }
}

impl FieldValue for u32 {
    fn is_set(&self) -> bool {
        *self != 0
    }
}

impl FieldValue for u64 {
    fn is_set(&self) -> bool {
        *self != 0
    }
}

impl FieldValue for Timespec {
    fn is_set(&self) -> bool {
        *self != Timespec::ZERO
    }
}

impl<T: Copy> FieldValue for Option<T> {
    fn is_set(&self) -> bool {
        self.is_some()
    }
}

impl FieldValue for NodeKind {}
impl FieldValue for Uid {}
impl FieldValue for Gid {}

fn pick<T: FieldValue>(policy: FieldPolicy, current: T, candidate: T) -> T {
    match policy {
        FieldPolicy::Candidate => candidate,
        FieldPolicy::Current => current,
        FieldPolicy::CandidateIfSet if candidate.is_set() => candidate,
        FieldPolicy::CandidateIfSet => current,
    }
}

/// Combine two snapshots field group by field group.
pub fn merge(current: &AttrSnapshot, candidate: &AttrSnapshot, policy: &MergePolicy) -> AttrSnapshot {
    let id = policy.identity;
    AttrSnapshot {
        ino: pick(id, current.ino, candidate.ino),
        size: pick(policy.size, current.size, candidate.size),
        blocks: pick(policy.size, current.blocks, candidate.blocks),
        atime: pick(policy.times, current.atime, candidate.atime),
        mtime: pick(policy.times, current.mtime, candidate.mtime),
        ctime: pick(policy.times, current.ctime, candidate.ctime),
        crtime: pick(policy.xtimes, current.crtime, candidate.crtime),
        bkuptime: pick(policy.xtimes, current.bkuptime, candidate.bkuptime),
        mode: pick(id, current.mode, candidate.mode),
        kind: pick(id, current.kind, candidate.kind),
        nlink: pick(id, current.nlink, candidate.nlink),
        uid: pick(id, current.uid, candidate.uid),
        gid: pick(id, current.gid, candidate.gid),
        rdev: pick(id, current.rdev, candidate.rdev),
        flags: pick(id, current.flags, candidate.flags),
        iosize: pick(id, current.iosize, candidate.iosize),
        data_alloc: pick(policy.data_alloc, current.data_alloc, candidate.data_alloc),
    }
}

// ── Per-node state ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct AttrState {
    snapshot: Option<AttrSnapshot>,
    valid_until: Timespec,
    /// Size as tracked by local writes.
    local_size: Option<u64>,
    /// Last modify time seen from the daemon.
    modify_time: Option<Timespec>,
}

/// Side effects decided under the node lock and run after it is dropped.
#[derive(Debug, Default)]
struct Effects {
    flush: Option<u64>,
    resize: Option<u64>,
    hint: ChangeHint,
}

// ── AttributeCache ──────────────────────────────────────────────────────────

pub struct AttributeCache {
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    content: Arc<dyn ContentCache>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl AttributeCache {
    pub fn new(
        session: Arc<Session>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        content: Arc<dyn ContentCache>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        Self {
            session,
            dispatcher,
            clock,
            content,
            notifier,
        }
    }

    pub fn now(&self) -> Timespec {
        self.clock.now()
    }

    /// Fold a daemon attribute reply into the node's cached state.
    pub fn reconcile(&self, node: &Node, attr: &Attr, ttl: Timespec) -> Result<AttrSnapshot> {
        let mut candidate = AttrSnapshot::from_wire(attr, &self.session)?;
        let deadline = (self.clock.now() + ttl).truncate_to(self.session.clock_granularity());
        let async_writes = self.session.is_async_writes();
        let mut effects = Effects::default();

        let snapshot = {
            let mut state = node.attrs.lock();

            if let Some(local) = state.local_size {
                if async_writes {
                    candidate.size = local;
                } else if local != candidate.size {
                    effects.flush = Some(local);
                    effects.resize = Some(candidate.size);
                    effects.hint |= ChangeHint::WRITE;
                    effects.hint |= if candidate.size < local {
                        ChangeHint::TRUNCATE
                    } else {
                        ChangeHint::EXTEND
                    };
                }
            }

            if let Some(seen) = state.modify_time {
                if seen != candidate.mtime {
                    effects.hint |= ChangeHint::ATTRIB;
                    if effects.flush.is_none() && !self.session.is_keep_cache() {
                        effects.flush = Some(candidate.size);
                    }
                }
            }

            let merged = match &state.snapshot {
                Some(current) => merge(current, &candidate, &MergePolicy::refresh()),
                None => candidate,
            };
            state.local_size = Some(merged.size);
            state.modify_time = Some(merged.mtime);
            state.valid_until = deadline;
            state.snapshot = Some(merged.clone());
            merged
        };

        self.apply(node, effects);
        tracing::trace!(node = %node.id(), size = snapshot.size, until = %deadline, "attributes reconciled");
        Ok(snapshot)
    }

    fn apply(&self, node: &Node, effects: Effects) {
        let id = node.id();
        if let Some(size) = effects.flush {
            tracing::debug!(node = %id, size, "flushing buffered content");
            self.content.flush_and_invalidate(id, size);
        }
        if let Some(size) = effects.resize {
            self.content.set_size(id, size);
        }
        if !effects.hint.is_empty() {
            self.notifier.notify(id, effects.hint);
        }
    }

    /// Write back buffered content as the last writable handle closes,
    /// unless the mount opted out.
    pub fn sync_on_close(&self, node: &Node) {
        if self.session.is_no_sync_on_close(node) {
            return;
        }
        tracing::trace!(node = %node.id(), "syncing buffered content on close");
        self.content.sync(node.id());
    }

    /// Whether the cached snapshot may still answer queries at `now`.
    pub fn is_valid(&self, node: &Node, now: Timespec) -> bool {
        if self.session.is_no_attrcache() {
            return false;
        }
        let state = node.attrs.lock();
        state.snapshot.is_some() && now < state.valid_until
    }

    /// The snapshot, if still valid.
    pub fn cached(&self, node: &Node) -> Option<AttrSnapshot> {
        let now = self.clock.now();
        if !self.is_valid(node, now) {
            return None;
        }
        node.attrs.lock().snapshot.clone()
    }

    /// The snapshot regardless of its deadline.
    pub fn peek(&self, node: &Node) -> Option<AttrSnapshot> {
        node.attrs.lock().snapshot.clone()
    }

    pub fn deadline(&self, node: &Node) -> Timespec {
        node.attrs.lock().valid_until
    }

    /// Expire the snapshot. The last known values stay for `peek`.
    pub fn invalidate(&self, node: &Node) {
        node.attrs.lock().valid_until = Timespec::ZERO;
    }

    /// Record a size produced by local writes.
    pub fn set_local_size(&self, node: &Node, size: u64) {
        let mut state = node.attrs.lock();
        state.local_size = Some(size);
        if self.session.is_async_writes() {
            if let Some(snapshot) = state.snapshot.as_mut() {
                snapshot.size = size;
            }
        }
    }

    pub fn local_size(&self, node: &Node) -> Option<u64> {
        node.attrs.lock().local_size
    }

    /// Create and backup times, asking the daemon only when the cached
    /// snapshot lacks them and the session can answer.
    pub fn load_xtimes(&self, ctx: &RequestContext, node: &Node) -> Result<ExtendedTimes> {
        let known = self
            .peek(node)
            .map(|s| s.extended_times())
            .unwrap_or_default();
        if known.is_complete()
            || !self.session.has(MountFlags::XTIMES)
            || !self.session.is_implemented(Opcode::Getxtimes)
        {
            return Ok(known);
        }

        let out = match self
            .dispatcher
            .call::<XtimesOut>(ctx, Opcode::Getxtimes, node.id(), &[])
        {
            Ok(out) => out,
            Err(FuseError::NotImplemented(_)) => return Ok(known),
            Err(e) => return Err(e),
        };
        let fetched = ExtendedTimes {
            crtime: Some(out.crtime()),
            bkuptime: Some(out.bkuptime()),
        };
        if let Some(snapshot) = node.attrs.lock().snapshot.as_mut() {
            snapshot.crtime = fetched.crtime;
            snapshot.bkuptime = fetched.bkuptime;
        }
        Ok(fetched)
    }
}
