//! Creating, looking up and forgetting nodes.

use std::sync::Arc;

use kfuse_proto::ops::EntryOut;
use kfuse_proto::Opcode;
use kfuse_types::NodeId;

use crate::access::AccessGuard;
use crate::bridge::Bridge;
use crate::diag::Severity;
use crate::dispatch::RequestContext;
use crate::error::{FuseError, Result};
use crate::handle::HandleMode;
use crate::name_cache::NameLookup;
use crate::node::{Node, NodeKind};

/// Validate a creation reply before any local state is built from it.
pub fn check_entry(entry: &EntryOut, expected: NodeKind) -> Result<()> {
    let id = entry.node();
    if id == NodeId::NULL {
        return Err(FuseError::Protocol("daemon returned the null node id".into()));
    }
    if id.is_root() {
        return Err(FuseError::Protocol("daemon returned the root node id for a new entry".into()));
    }
    match NodeKind::from_mode(entry.attr.mode) {
        Some(kind) if kind == expected => Ok(()),
        got => Err(FuseError::Protocol(format!(
            "node {id} created as {got:?}, expected {expected:?}"
        ))),
    }
}

impl Bridge {
    /// Issue a creating request (MKDIR, MKNOD, SYMLINK, CREATE, LINK, ...)
    /// under `parent` and build local state from the reply.
    pub fn create_entry(
        &self,
        ctx: &RequestContext,
        parent: NodeId,
        name: &str,
        opcode: Opcode,
        payload: &[u8],
        kind: NodeKind,
    ) -> Result<Arc<Node>> {
        AccessGuard::check(parent, &self.session, ctx)?;
        let entry: EntryOut = self.dispatcher.call(ctx, opcode, parent, payload)?;

        if let Err(e) = check_entry(&entry, kind) {
            let id = entry.node();
            // The daemon counted a lookup for an id we will never use.
            if !id.is_reserved() {
                self.forget(id, 1);
            }
            self.session.diag().record(
                Severity::Error,
                Some(parent),
                &format!("{opcode} of {name:?} rejected: {e}"),
            );
            return Err(e);
        }

        let node = self.nodes.register(entry.node(), kind, parent, entry.generation);
        self.attrs.reconcile(&node, &entry.attr, entry.attr_ttl())?;
        self.names.insert(parent, name, node.id());
        if let Some(dir) = self.nodes.get(parent) {
            self.attrs.invalidate(&dir);
        }
        tracing::debug!(node = %node.id(), parent = %parent, %opcode, "entry created");
        Ok(node)
    }

    /// Record the result of a LOOKUP performed outside the bridge. A zero
    /// node id is a negative answer.
    pub fn register_lookup(
        &self,
        ctx: &RequestContext,
        parent: NodeId,
        name: &str,
        entry: &EntryOut,
    ) -> Result<Option<Arc<Node>>> {
        AccessGuard::check(parent, &self.session, ctx)?;
        let id = entry.node();
        if id == NodeId::NULL {
            self.names.insert_negative(parent, name);
            return Ok(None);
        }
        let kind = NodeKind::from_mode(entry.attr.mode).ok_or_else(|| {
            FuseError::Protocol(format!("lookup of {name:?} returned mode {:o}", entry.attr.mode))
        })?;

        let node = if id.is_root() {
            self.nodes.insert_root()
        } else {
            self.nodes.register(id, kind, parent, entry.generation)
        };
        if node.kind() != kind {
            let message = format!("node {id} changed type from {:?} to {kind:?}", node.kind());
            self.session.diag().record(Severity::Error, Some(id), &message);
            self.names.purge_node(id);
            return Err(FuseError::Protocol(message));
        }
        self.attrs.reconcile(&node, &entry.attr, entry.attr_ttl())?;
        self.names.insert(parent, name, id);
        Ok(Some(node))
    }

    /// Resolve `name` under `parent`, from the name cache when possible.
    pub fn lookup(&self, ctx: &RequestContext, parent: NodeId, name: &str) -> Result<Option<Arc<Node>>> {
        AccessGuard::check(parent, &self.session, ctx)?;
        if self.session.skips_name(name) {
            return Ok(None);
        }
        match self.names.lookup(parent, name) {
            NameLookup::Hit(id) => {
                if let Some(node) = self.nodes.get(id) {
                    return Ok(Some(node));
                }
                self.names.remove(parent, name);
            }
            NameLookup::Negative => return Ok(None),
            NameLookup::Miss => {}
        }

        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        match self.dispatcher.call::<EntryOut>(ctx, Opcode::Lookup, parent, &payload) {
            Ok(entry) => self.register_lookup(ctx, parent, name, &entry),
            Err(FuseError::NotFound(_)) => {
                self.names.insert_negative(parent, name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Tell the daemon to drop `nlookup` lookups of `node`. Never blocks
    /// and never fails; problems are only logged.
    pub fn forget(&self, node: NodeId, nlookup: u64) {
        if nlookup == 0 || self.session.is_dead() {
            return;
        }
        if let Err(e) = self.dispatcher.send_forget(node, nlookup) {
            tracing::debug!(node = %node, nlookup, error = %e, "forget not sent");
        }
    }

    /// Drop all local state for `id`: release held handles, purge names,
    /// and forget every outstanding lookup. The root is never reclaimed.
    pub fn reclaim(&self, id: NodeId) {
        if id.is_root() {
            return;
        }
        let Some(node) = self.nodes.remove(id) else {
            return;
        };
        let ctx = RequestContext::kernel();
        for mode in HandleMode::ALL {
            if self.handles.handle(&node, mode).is_none() {
                continue;
            }
            if let Err(e) = self.handles.release(&ctx, &node, mode) {
                tracing::debug!(node = %id, %mode, error = %e, "release during reclaim failed");
            }
        }
        self.names.purge_node(id);
        self.forget(id, node.take_lookups());
        tracing::trace!(node = %id, "node reclaimed");
    }
}
