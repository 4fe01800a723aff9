//! The node-operation boundary.
//!
//! [`Bridge`] owns one session's dispatcher, node table and caches. Every
//! entry point admits the caller through [`AccessGuard`] before touching
//! any cached state.

use std::sync::Arc;

use kfuse_proto::ops::{AttrOut, GetattrIn};
use kfuse_proto::{Opcode, WireEncode};
use kfuse_types::{FileHandleId, NodeId};

use crate::access::AccessGuard;
use crate::attr::{AttrSnapshot, AttributeCache, ExtendedTimes};
use crate::clock::{Clock, MonotonicClock};
use crate::dispatch::{Dispatcher, Outcome, Reply, RequestContext};
use crate::error::{FuseError, Result};
use crate::handle::{FileHandleTable, HandleMode};
use crate::name_cache::NameCache;
use crate::node::{Node, NodeTable};
use crate::notify::{ChangeNotifier, ContentCache, NoopHooks};
use crate::session::{Session, StatsSnapshot};
use crate::transport::{ChannelTransport, DaemonEnd, ReplySink, Transport};

/// Collaborators outside the core.
pub struct BridgeHooks {
    pub content: Arc<dyn ContentCache>,
    pub notifier: Arc<dyn ChangeNotifier>,
    pub clock: Arc<dyn Clock>,
}

impl Default for BridgeHooks {
    fn default() -> Self {
        Self {
            content: Arc::new(NoopHooks),
            notifier: Arc::new(NoopHooks),
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

pub struct Bridge {
    pub(crate) session: Arc<Session>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) nodes: NodeTable,
    pub(crate) names: Arc<NameCache>,
    pub(crate) attrs: Arc<AttributeCache>,
    pub(crate) handles: FileHandleTable,
}

impl Bridge {
    /// Build a bridge over `transport`. Replies must be fed to
    /// [`Bridge::reply_sink`].
    pub fn new(session: Arc<Session>, transport: Arc<dyn Transport>, hooks: BridgeHooks) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&session), Arc::clone(&transport)));
        let names = Arc::new(NameCache::new(&session));
        let attrs = Arc::new(AttributeCache::new(
            Arc::clone(&session),
            Arc::clone(&dispatcher),
            hooks.clock,
            hooks.content,
            hooks.notifier,
        ));
        let handles = FileHandleTable::new(
            Arc::clone(&session),
            Arc::clone(&dispatcher),
            Arc::clone(&names),
            Arc::clone(&attrs),
        );
        let nodes = NodeTable::new();
        nodes.insert_root();
        tracing::info!(flags = ?session.flags(), iosize = session.iosize(), "bridge created");
        Self {
            session,
            dispatcher,
            transport,
            nodes,
            names,
            attrs,
            handles,
        }
    }

    /// A bridge wired to an in-process daemon over crossbeam channels.
    pub fn connect_channel(session: Arc<Session>, hooks: BridgeHooks) -> Result<(Bridge, DaemonEnd)> {
        let (transport, daemon) = ChannelTransport::pair();
        let transport = Arc::new(transport);
        let bridge = Bridge::new(session, Arc::clone(&transport) as Arc<dyn Transport>, hooks);
        transport.start(bridge.reply_sink())?;
        Ok((bridge, daemon))
    }

    pub fn reply_sink(&self) -> Arc<dyn ReplySink> {
        Arc::clone(&self.dispatcher) as Arc<dyn ReplySink>
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.get(id)
    }

    fn admit(&self, ctx: &RequestContext, id: NodeId) -> Result<Arc<Node>> {
        AccessGuard::check(id, &self.session, ctx)?;
        self.nodes.get(id).ok_or(FuseError::NotFound(id))
    }

    // ── Handles ─────────────────────────────────────────────────────────

    pub fn acquire_handle(&self, ctx: &RequestContext, id: NodeId, mode: HandleMode) -> Result<FileHandleId> {
        let node = self.admit(ctx, id)?;
        self.handles.acquire(ctx, &node, mode)
    }

    pub fn release_handle(&self, ctx: &RequestContext, id: NodeId, mode: HandleMode) -> Result<()> {
        let node = self.admit(ctx, id)?;
        self.handles.release(ctx, &node, mode)
    }

    /// Open for the access mode in `open_flags`, sharing a held handle.
    pub fn open_handle(&self, ctx: &RequestContext, id: NodeId, open_flags: i32) -> Result<FileHandleId> {
        let node = self.admit(ctx, id)?;
        let mode = HandleMode::from_open_flags(open_flags);
        self.handles.open(ctx, &node, mode, open_flags as u32)
    }

    pub fn close_handle(&self, ctx: &RequestContext, id: NodeId, mode: HandleMode) -> Result<()> {
        let node = self.admit(ctx, id)?;
        self.handles.close(ctx, &node, mode)
    }

    // ── Attributes ──────────────────────────────────────────────────────

    pub fn read_attributes(&self, ctx: &RequestContext, id: NodeId) -> Result<AttrSnapshot> {
        let node = self.admit(ctx, id)?;
        if let Some(snapshot) = self.attrs.cached(&node) {
            return Ok(snapshot);
        }
        if self.session.is_dead() {
            if id.is_root() {
                return Ok(self
                    .attrs
                    .peek(&node)
                    .unwrap_or_else(|| AttrSnapshot::dead_root(&self.session)));
            }
            return Err(FuseError::SessionDead);
        }

        let payload = GetattrIn::default().to_wire();
        let out: AttrOut = match self.dispatcher.call(ctx, Opcode::Getattr, id, &payload) {
            Ok(out) => out,
            Err(e) => {
                if e.is_not_found() {
                    self.names.purge_node(id);
                }
                return Err(e);
            }
        };
        self.attrs.reconcile(&node, &out.attr, out.ttl())
    }

    pub fn read_xtimes(&self, ctx: &RequestContext, id: NodeId) -> Result<ExtendedTimes> {
        let node = self.admit(ctx, id)?;
        self.attrs.load_xtimes(ctx, &node)
    }

    /// Record a size produced by local writes.
    pub fn set_local_size(&self, ctx: &RequestContext, id: NodeId, size: u64) -> Result<()> {
        let node = self.admit(ctx, id)?;
        self.attrs.set_local_size(&node, size);
        Ok(())
    }

    pub fn invalidate_attributes(&self, ctx: &RequestContext, id: NodeId) -> Result<()> {
        let node = self.admit(ctx, id)?;
        self.attrs.invalidate(&node);
        Ok(())
    }

    // ── Requests ────────────────────────────────────────────────────────

    /// Relay an arbitrary request. Interruption surfaces as
    /// [`FuseError::Interrupted`].
    pub fn dispatch(&self, ctx: &RequestContext, opcode: Opcode, id: NodeId, payload: &[u8]) -> Result<Reply> {
        AccessGuard::check(id, &self.session, ctx)?;
        match self.dispatcher.send(ctx, opcode, id, payload)? {
            Outcome::Answered(reply) => Ok(reply),
            Outcome::Interrupted => Err(FuseError::Interrupted),
        }
    }

    pub fn is_implemented(&self, opcode: Opcode) -> bool {
        self.dispatcher.is_implemented(opcode)
    }

    pub fn mark_unimplemented(&self, opcode: Opcode) {
        self.dispatcher.mark_unimplemented(opcode);
    }

    /// INIT completed; the uninitialized-root admission no longer applies.
    pub fn mark_initialized(&self) {
        self.session.mark_initialized();
    }

    pub fn skips_name(&self, name: &str) -> bool {
        self.session.skips_name(name)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.session.stats().snapshot()
    }

    /// Mark the session dead, wake every blocked caller, then close the
    /// transport. Safe to call more than once.
    pub fn teardown(&self) {
        if self.session.mark_dead() {
            tracing::info!(pending = self.dispatcher.pending(), "tearing down session");
        }
        self.dispatcher.abort_all();
        self.transport.close();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    use kfuse_proto::ops::OpenOut;
    use kfuse_types::{Gid, Pid, Uid};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::dispatch::InterruptToken;
    use crate::name_cache::NameLookup;
    use crate::node::NodeKind;
    use crate::session::{Credential, MountFlags};
    use crate::testing::{attr_out, bridge_with, entry_out, file_attr, user_ctx, Script};

    fn stranger() -> RequestContext {
        RequestContext::new(Credential::new(Uid::from(999), Gid::from(999)), Pid::from(400))
    }

    fn open_reply(fh: u64) -> Script {
        Script::reply(OpenOut {
            fh,
            open_flags: 0,
            padding: 0,
        })
    }

    /// Bridge with one regular file, node 5, known under the root as "f".
    fn with_file<F>(flags: MountFlags, handler: F) -> crate::testing::BridgeHarness
    where
        F: Fn(&kfuse_proto::InHeader, &bytes::Bytes) -> Script + Send + Sync + 'static,
    {
        let h = bridge_with(flags, handler);
        h.bridge
            .register_lookup(&user_ctx(), NodeId::ROOT, "f", &entry_out(file_attr(5, 10), 1))
            .unwrap();
        h
    }

    #[test]
    fn test_entry_points_deny_strangers() {
        let h = with_file(MountFlags::empty(), |_, _| open_reply(1));
        let id = NodeId::from(5);
        assert!(matches!(
            h.bridge.acquire_handle(&stranger(), id, HandleMode::ReadOnly),
            Err(FuseError::AccessDenied)
        ));
        assert!(matches!(
            h.bridge.read_attributes(&stranger(), id),
            Err(FuseError::AccessDenied)
        ));
        assert!(matches!(
            h.bridge.dispatch(&stranger(), Opcode::Flush, id, &[]),
            Err(FuseError::AccessDenied)
        ));
        assert_eq!(h.daemon.requests().len(), 0);
    }

    #[test]
    fn test_unknown_node_is_not_found() {
        let h = bridge_with(MountFlags::empty(), |_, _| Script::Empty);
        assert!(h
            .bridge
            .read_attributes(&user_ctx(), NodeId::from(77))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_read_attributes_caches_until_deadline() {
        let h = with_file(MountFlags::empty(), |_, _| Script::reply(attr_out(file_attr(5, 10), 2)));
        let id = NodeId::from(5);
        // Lookup reply carried a 1 s TTL.
        h.bridge.read_attributes(&user_ctx(), id).unwrap();
        assert_eq!(h.daemon.count(Opcode::Getattr), 0);

        h.clock.advance(Duration::from_secs(1));
        h.bridge.read_attributes(&user_ctx(), id).unwrap();
        assert_eq!(h.daemon.count(Opcode::Getattr), 1);
        h.bridge.read_attributes(&user_ctx(), id).unwrap();
        assert_eq!(h.daemon.count(Opcode::Getattr), 1);
    }

    #[test]
    fn test_getattr_enoent_purges_names() {
        let h = with_file(MountFlags::empty(), |_, _| Script::Errno(libc::ENOENT));
        h.bridge.invalidate_attributes(&user_ctx(), NodeId::from(5)).unwrap();
        assert!(h
            .bridge
            .read_attributes(&user_ctx(), NodeId::from(5))
            .unwrap_err()
            .is_not_found());
        assert_eq!(h.bridge.names.lookup(NodeId::ROOT, "f"), NameLookup::Miss);
    }

    #[test]
    fn test_acquire_enoent_purges_names() {
        let h = with_file(MountFlags::empty(), |_, _| Script::Errno(libc::ENOENT));
        let err = h
            .bridge
            .acquire_handle(&user_ctx(), NodeId::from(5), HandleMode::ReadOnly)
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.bridge.names.lookup(NodeId::ROOT, "f"), NameLookup::Miss);
    }

    #[test]
    fn test_release_invalidates_attributes() {
        let h = with_file(MountFlags::empty(), |hdr, _| match hdr.opcode().unwrap() {
            Opcode::Open => open_reply(3),
            _ => Script::Empty,
        });
        let id = NodeId::from(5);
        h.bridge.acquire_handle(&user_ctx(), id, HandleMode::WriteOnly).unwrap();
        h.bridge.release_handle(&user_ctx(), id, HandleMode::WriteOnly).unwrap();
        let node = h.bridge.node(id).unwrap();
        assert!(h.bridge.attrs.cached(&node).is_none());
        let stats = h.bridge.stats();
        assert_eq!(stats.fh_upcalls, 1);
        assert_eq!(stats.fh_current, 0);
    }

    #[test]
    fn test_open_handle_maps_access_mode() {
        let h = with_file(MountFlags::empty(), |_, _| open_reply(3));
        let id = NodeId::from(5);
        h.bridge.open_handle(&user_ctx(), id, libc::O_RDWR | libc::O_TRUNC).unwrap();
        let node = h.bridge.node(id).unwrap();
        assert!(h.bridge.handles.handle(&node, HandleMode::ReadWrite).is_some());
        assert!(h.bridge.handles.handle(&node, HandleMode::ReadOnly).is_none());
    }

    #[test]
    fn test_async_write_size_wins_through_bridge() {
        let h = with_file(MountFlags::NO_SYNCWRITES, |_, _| {
            Script::reply(attr_out(file_attr(5, 80), 1))
        });
        let id = NodeId::from(5);
        h.bridge.set_local_size(&user_ctx(), id, 100).unwrap();
        h.bridge.invalidate_attributes(&user_ctx(), id).unwrap();
        assert_eq!(h.bridge.read_attributes(&user_ctx(), id).unwrap().size, 100);
        assert!(!h.changes.hints_for(id).contains(crate::notify::ChangeHint::TRUNCATE));
    }

    #[test]
    fn test_sync_write_size_truncates_through_bridge() {
        let h = with_file(MountFlags::empty(), |_, _| Script::reply(attr_out(file_attr(5, 80), 1)));
        let id = NodeId::from(5);
        h.bridge.set_local_size(&user_ctx(), id, 100).unwrap();
        h.bridge.invalidate_attributes(&user_ctx(), id).unwrap();
        assert_eq!(h.bridge.read_attributes(&user_ctx(), id).unwrap().size, 80);
        assert!(h.changes.hints_for(id).contains(crate::notify::ChangeHint::TRUNCATE));
        assert_eq!(h.changes.flushes(), 1);
    }

    #[test]
    fn test_optional_enosys_short_circuits() {
        let h = bridge_with(MountFlags::empty(), |_, _| Script::Errno(libc::ENOSYS));
        let err = h
            .bridge
            .dispatch(&user_ctx(), Opcode::Setxattr, NodeId::ROOT, &[])
            .unwrap_err();
        assert!(matches!(err, FuseError::NotImplemented(Opcode::Setxattr)));
        assert!(!h.bridge.is_implemented(Opcode::Setxattr));
        let again = h
            .bridge
            .dispatch(&user_ctx(), Opcode::Setxattr, NodeId::ROOT, &[])
            .unwrap_err();
        assert!(matches!(again, FuseError::NotImplemented(_)));
        assert_eq!(h.daemon.count(Opcode::Setxattr), 1);
        assert!(!h.bridge.session.is_dead());
    }

    #[test]
    fn test_mandatory_enosys_kills_session() {
        let h = with_file(MountFlags::empty(), |_, _| Script::Errno(libc::ENOSYS));
        h.bridge.invalidate_attributes(&user_ctx(), NodeId::from(5)).unwrap();
        let err = h
            .bridge
            .read_attributes(&user_ctx(), NodeId::from(5))
            .unwrap_err();
        assert!(matches!(err, FuseError::NotImplemented(Opcode::Getattr)));
        h.daemon.settle(|| h.bridge.session.is_dead());
    }

    #[test]
    fn test_dead_session_root_answers_from_cache() {
        let h = bridge_with(MountFlags::empty(), |_, _| Script::Empty);
        h.bridge.teardown();
        let outsider = stranger();
        let root = h.bridge.read_attributes(&outsider, NodeId::ROOT).unwrap();
        assert_eq!(root.kind, NodeKind::Directory);
        assert_eq!(h.daemon.count(Opcode::Getattr), 0);
        assert!(matches!(
            h.bridge.read_attributes(&outsider, NodeId::from(5)),
            Err(FuseError::AccessDenied)
        ));
        assert!(matches!(
            h.bridge.dispatch(&user_ctx(), Opcode::Statfs, NodeId::ROOT, &[]),
            Err(FuseError::SessionDead)
        ));
    }

    #[test]
    fn test_teardown_wakes_blocked_callers() {
        let h = bridge_with(MountFlags::empty(), |_, _| Script::NoReply);
        let bridge = Arc::clone(&h.bridge);
        let waiter = thread::spawn(move || {
            bridge
                .dispatch(&user_ctx(), Opcode::Statfs, NodeId::ROOT, &[])
                .map(|_| ())
        });
        h.daemon.wait_for(Opcode::Statfs, 1);
        h.bridge.teardown();
        assert!(matches!(waiter.join().unwrap(), Err(FuseError::SessionDead)));
        assert!(h.bridge.session.is_dead());
        assert_eq!(h.bridge.stats().tickets_live, 0);
    }

    #[test]
    fn test_daemon_disconnect_kills_session() {
        let h = bridge_with(MountFlags::empty(), |_, _| Script::NoReply);
        let bridge = Arc::clone(&h.bridge);
        let waiter = thread::spawn(move || {
            bridge
                .dispatch(&user_ctx(), Opcode::Statfs, NodeId::ROOT, &[])
                .map(|_| ())
        });
        h.daemon.wait_for(Opcode::Statfs, 1);
        h.daemon.disconnect();
        assert!(matches!(waiter.join().unwrap(), Err(FuseError::SessionDead)));
        assert!(h.bridge.session.is_dead());
    }

    #[test]
    fn test_concurrent_requests_reach_their_callers() {
        let h = bridge_with(MountFlags::empty(), |hdr, _| {
            Script::reply(OpenOut {
                fh: hdr.unique().get(),
                open_flags: 0,
                padding: 0,
            })
        });
        let workers: Vec<_> = (0..16)
            .map(|_| {
                let bridge = Arc::clone(&h.bridge);
                thread::spawn(move || {
                    (0..20)
                        .map(|_| {
                            let reply = bridge
                                .dispatch(&user_ctx(), Opcode::Opendir, NodeId::ROOT, &[])
                                .unwrap();
                            let out: OpenOut = reply.decode().unwrap();
                            assert_eq!(out.fh, reply.unique().get());
                            out.fh
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for w in workers {
            for id in w.join().unwrap() {
                assert!(seen.insert(id), "identifier {id} reused");
            }
        }
        assert_eq!(seen.len(), 320);
    }

    #[test]
    fn test_stress_with_interrupts_and_teardown_releases_every_ticket() {
        let h = with_file(MountFlags::empty(), |hdr, _| {
            match hdr.unique().get() % 4 {
                0 => Script::NoReply,
                1 => Script::Errno(libc::EIO),
                _ => {
                    thread::sleep(Duration::from_micros(200));
                    Script::Empty
                }
            }
        });
        let workers: Vec<_> = (0..8u64)
            .map(|seed| {
                let bridge = Arc::clone(&h.bridge);
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    for _ in 0..200 {
                        let token = InterruptToken::new();
                        let ctx = user_ctx().with_interrupt(token.clone());
                        if rng.gen_bool(0.3) {
                            let token = token.clone();
                            let delay = rng.gen_range(0..300);
                            thread::spawn(move || {
                                thread::sleep(Duration::from_micros(delay));
                                token.fire();
                            });
                        } else if rng.gen_bool(0.3) {
                            // Unanswered requests must still be released; fire
                            // right away so the caller does not hang.
                            token.fire();
                        }
                        match bridge.dispatch(&ctx, Opcode::Flush, NodeId::from(5), &[]) {
                            Err(FuseError::SessionDead) => return,
                            Err(FuseError::Transport(_)) => return,
                            _ => {}
                        }
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        h.bridge.teardown();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(h.bridge.stats().tickets_live, 0);
        assert_eq!(h.bridge.stats().in_flight, 0);
        assert_eq!(h.bridge.dispatcher.pending(), 0);
    }

    #[test]
    fn test_dispatch_of_forget_returns_without_a_ticket() {
        let h = with_file(MountFlags::empty(), |_, _| Script::NoReply);
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        {
            let bridge = Arc::clone(&h.bridge);
            thread::spawn(move || {
                let payload = 1u64.to_le_bytes();
                let _ = done_tx.send(bridge.dispatch(&user_ctx(), Opcode::Forget, NodeId::from(5), &payload));
            });
        }
        let result = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("dispatch of FORGET blocked");
        assert!(matches!(result, Err(FuseError::Protocol(_))));
        assert_eq!(h.bridge.stats().tickets_live, 0);
        assert_eq!(h.bridge.dispatcher.pending(), 0);
        assert_eq!(h.daemon.count(Opcode::Forget), 0);
    }

    #[test]
    fn test_requests_racing_teardown_leave_no_tickets() {
        let h = with_file(MountFlags::empty(), |_, _| Script::NoReply);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let bridge = Arc::clone(&h.bridge);
                thread::spawn(move || loop {
                    match bridge.dispatch(&user_ctx(), Opcode::Flush, NodeId::from(5), &[]) {
                        Err(FuseError::SessionDead) | Err(FuseError::Transport(_)) => return,
                        other => panic!("unexpected outcome {other:?}"),
                    }
                })
            })
            .collect();
        h.daemon.wait_for(Opcode::Flush, 8);
        h.bridge.teardown();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(h.bridge.dispatcher.pending(), 0);
        assert_eq!(h.bridge.stats().tickets_live, 0);
        assert_eq!(h.bridge.stats().in_flight, 0);
    }
}
