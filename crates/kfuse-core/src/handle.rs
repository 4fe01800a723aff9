//! Per-node, per-mode daemon handles.
//!
//! Each node has one slot per [`HandleMode`]. A slot is `Invalid` (no
//! handle), `Opening` (an open exchange is in flight) or `Valid` (handle
//! held, count > 0). Slot transitions happen under the node's handle lock;
//! the open and release exchanges themselves run with the lock dropped.

use std::fmt;
use std::sync::Arc;

use kfuse_proto::ops::{OpenIn, OpenOut, ReleaseIn, O_SYMLINK};
use kfuse_proto::{Opcode, WireEncode};
use kfuse_types::FileHandleId;

use crate::attr::AttributeCache;
use crate::diag::Severity;
use crate::dispatch::{Dispatcher, RequestContext};
use crate::error::{FuseError, Result};
use crate::name_cache::NameCache;
use crate::node::Node;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl HandleMode {
    pub const ALL: [HandleMode; 3] = [
        HandleMode::ReadOnly,
        HandleMode::WriteOnly,
        HandleMode::ReadWrite,
    ];

    /// Mode implied by the access bits of open(2) flags.
    pub fn from_open_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => HandleMode::WriteOnly,
            libc::O_RDWR => HandleMode::ReadWrite,
            _ => HandleMode::ReadOnly,
        }
    }

    /// Flags sent to the daemon. Only the access mode survives; every
    /// other open(2) flag is filtered out.
    pub fn open_flags(self) -> u32 {
        let flags = match self {
            HandleMode::ReadOnly => libc::O_RDONLY,
            HandleMode::WriteOnly => libc::O_WRONLY,
            HandleMode::ReadWrite => libc::O_RDWR,
        };
        flags as u32
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for HandleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleMode::ReadOnly => "read-only",
            HandleMode::WriteOnly => "write-only",
            HandleMode::ReadWrite => "read-write",
        })
    }
}

/// A held daemon handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenHandle {
    pub fh: FileHandleId,
    pub count: u32,
    /// Flags sent with the open request.
    pub open_flags: u32,
    /// Flags the daemon answered with.
    pub fuse_open_flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Slot {
    #[default]
    Invalid,
    Opening,
    Valid(OpenHandle),
}

impl Slot {
    fn describe(&self) -> &'static str {
        match self {
            Slot::Invalid => "invalid",
            Slot::Opening => "opening",
            Slot::Valid(_) => "valid",
        }
    }
}

#[derive(Debug, Default)]
pub struct HandleSlots {
    slots: [Slot; 3],
}

impl HandleSlots {
    pub(crate) fn get(&self, mode: HandleMode) -> Slot {
        self.slots[mode.index()]
    }

    fn set(&mut self, mode: HandleMode, slot: Slot) {
        self.slots[mode.index()] = slot;
    }
}

// ── FileHandleTable ─────────────────────────────────────────────────────────

pub struct FileHandleTable {
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    names: Arc<NameCache>,
    attrs: Arc<AttributeCache>,
}

impl FileHandleTable {
    pub fn new(
        session: Arc<Session>,
        dispatcher: Arc<Dispatcher>,
        names: Arc<NameCache>,
        attrs: Arc<AttributeCache>,
    ) -> Self {
        Self {
            session,
            dispatcher,
            names,
            attrs,
        }
    }

    /// Directories only ever hold a read-only handle.
    fn effective_mode(node: &Node, mode: HandleMode) -> HandleMode {
        if node.is_dir() {
            HandleMode::ReadOnly
        } else {
            mode
        }
    }

    /// Current handle for `mode`, if one is held.
    pub fn handle(&self, node: &Node, mode: HandleMode) -> Option<OpenHandle> {
        match node.handles.lock().get(Self::effective_mode(node, mode)) {
            Slot::Valid(h) => Some(h),
            _ => None,
        }
    }

    /// Open a new daemon handle. The slot must be invalid.
    pub fn acquire(&self, ctx: &RequestContext, node: &Node, mode: HandleMode) -> Result<FileHandleId> {
        self.acquire_with_flags(ctx, node, mode, 0)
    }

    /// `acquire`, passing the caller's raw open flags so an `O_SYMLINK`
    /// request on a symlink reaches the daemon.
    pub fn acquire_with_flags(
        &self,
        ctx: &RequestContext,
        node: &Node,
        requested: HandleMode,
        request_flags: u32,
    ) -> Result<FileHandleId> {
        let mode = Self::effective_mode(node, requested);
        {
            let mut slots = node.handles.lock();
            let slot = slots.get(mode);
            if slot != Slot::Invalid {
                drop(slots);
                return Err(self.session.contract_violation(
                    node.id(),
                    format!("acquire of {mode} handle that is already {}", slot.describe()),
                ));
            }
            slots.set(mode, Slot::Opening);
        }
        self.fill_slot(ctx, node, requested, mode, request_flags)
    }

    /// Reuse a held handle (bumping its count), wait out an open already in
    /// flight, or open a new one.
    pub fn open(
        &self,
        ctx: &RequestContext,
        node: &Node,
        requested: HandleMode,
        request_flags: u32,
    ) -> Result<FileHandleId> {
        let mode = Self::effective_mode(node, requested);
        let mut slots = node.handles.lock();
        loop {
            match slots.get(mode) {
                Slot::Valid(mut h) => {
                    h.count += 1;
                    slots.set(mode, Slot::Valid(h));
                    return Ok(h.fh);
                }
                Slot::Opening => node.handles_changed.wait(&mut slots),
                Slot::Invalid => {
                    slots.set(mode, Slot::Opening);
                    break;
                }
            }
        }
        drop(slots);
        self.fill_slot(ctx, node, requested, mode, request_flags)
    }

    /// Run the open exchange for a slot already marked `Opening`.
    fn fill_slot(
        &self,
        ctx: &RequestContext,
        node: &Node,
        requested: HandleMode,
        mode: HandleMode,
        request_flags: u32,
    ) -> Result<FileHandleId> {
        if requested != mode {
            self.session.diag().record(
                Severity::Warning,
                Some(node.id()),
                &format!("{requested} handle requested for directory, using {mode}"),
            );
        }

        let mut oflags = mode.open_flags();
        if node.is_symlink() && request_flags & O_SYMLINK != 0 {
            oflags |= O_SYMLINK;
        }
        let opcode = if node.is_dir() {
            Opcode::Opendir
        } else {
            Opcode::Open
        };

        self.session.stats().fh_upcalls.inc();
        // Uninterruptible: a daemon handle must never exist without a
        // local slot owning it.
        let result = self.dispatcher.call::<OpenOut>(
            &ctx.uninterruptible(),
            opcode,
            node.id(),
            &OpenIn::new(oflags).to_wire(),
        );

        {
            let mut slots = node.handles.lock();
            match &result {
                Ok(out) => slots.set(
                    mode,
                    Slot::Valid(OpenHandle {
                        fh: out.handle(),
                        count: 1,
                        open_flags: oflags,
                        fuse_open_flags: out.open_flags,
                    }),
                ),
                Err(_) => slots.set(mode, Slot::Invalid),
            }
            node.handles_changed.notify_all();
        }

        match result {
            Ok(out) => {
                self.session.stats().fh_current.inc();
                if out.direct_io() {
                    node.set_direct_io(true);
                }
                tracing::debug!(node = %node.id(), fh = %out.handle(), %mode, "handle acquired");
                Ok(out.handle())
            }
            Err(e) => {
                if e.is_not_found() {
                    let purged = self.names.purge_node(node.id());
                    tracing::debug!(node = %node.id(), purged, "stale node purged from name cache");
                }
                self.session.diag().record(
                    Severity::Error,
                    Some(node.id()),
                    &format!("{opcode} for {mode} handle failed: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Give up the handle for `mode` regardless of its count. The slot must
    /// be valid.
    pub fn release(&self, ctx: &RequestContext, node: &Node, mode: HandleMode) -> Result<()> {
        let mode = Self::effective_mode(node, mode);
        let handle = {
            let mut slots = node.handles.lock();
            match slots.get(mode) {
                Slot::Valid(h) => {
                    slots.set(mode, Slot::Invalid);
                    node.handles_changed.notify_all();
                    h
                }
                other => {
                    drop(slots);
                    return Err(self.session.contract_violation(
                        node.id(),
                        format!("release of {mode} handle that is {}", other.describe()),
                    ));
                }
            }
        };
        self.put(ctx, node, mode, handle)
    }

    /// Drop one reference; the handle is released when the count reaches
    /// zero.
    pub fn close(&self, ctx: &RequestContext, node: &Node, mode: HandleMode) -> Result<()> {
        let mode = Self::effective_mode(node, mode);
        let handle = {
            let mut slots = node.handles.lock();
            match slots.get(mode) {
                Slot::Valid(mut h) if h.count > 1 => {
                    h.count -= 1;
                    slots.set(mode, Slot::Valid(h));
                    return Ok(());
                }
                Slot::Valid(h) => {
                    slots.set(mode, Slot::Invalid);
                    node.handles_changed.notify_all();
                    h
                }
                other => {
                    drop(slots);
                    return Err(self.session.contract_violation(
                        node.id(),
                        format!("close of {mode} handle that is {}", other.describe()),
                    ));
                }
            }
        };
        if mode != HandleMode::ReadOnly && !self.session.is_dead() {
            self.attrs.sync_on_close(node);
        }
        self.put(ctx, node, mode, handle)
    }

    /// Tell the daemon a handle is gone. The slot is already invalid.
    fn put(&self, ctx: &RequestContext, node: &Node, mode: HandleMode, handle: OpenHandle) -> Result<()> {
        let result = if self.session.is_dead() {
            Ok(())
        } else {
            let opcode = if node.is_dir() {
                Opcode::Releasedir
            } else {
                Opcode::Release
            };
            let payload = ReleaseIn::new(handle.fh, handle.open_flags).to_wire();
            match self
                .dispatcher
                .call_empty(&ctx.uninterruptible(), opcode, node.id(), &payload)
            {
                Err(FuseError::SessionDead) => Ok(()),
                other => other,
            }
        };

        self.session.stats().fh_current.dec();
        self.attrs.invalidate(node);

        if let Err(e) = &result {
            self.session.diag().record(
                Severity::Warning,
                Some(node.id()),
                &format!("release of {mode} handle {} failed: {e}", handle.fh),
            );
        } else {
            tracing::debug!(node = %node.id(), fh = %handle.fh, %mode, "handle released");
        }
        result
    }
}
