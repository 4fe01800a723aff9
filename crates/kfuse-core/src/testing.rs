//! Scripted in-process daemon and fixtures shared by the unit tests.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::Sender;
use kfuse_proto::header::decode_request;
use kfuse_proto::ops::{Attr, AttrOut, EntryOut};
use kfuse_proto::{InHeader, Opcode, OutHeader, WireEncode};
use kfuse_types::{Gid, Pid, RequestId, Timespec, Uid};
use parking_lot::{Condvar, Mutex};

use crate::attr::AttributeCache;
use crate::bridge::{Bridge, BridgeHooks};
use crate::clock::ManualClock;
use crate::config::ContractPolicy;
use crate::diag::MemorySink;
use crate::dispatch::{Dispatcher, RequestContext};
use crate::handle::FileHandleTable;
use crate::name_cache::NameCache;
use crate::notify::ChangeRecorder;
use crate::session::{Credential, MountFlags, Session};
use crate::transport::{ChannelTransport, DaemonEnd};

const PATIENCE: Duration = Duration::from_secs(5);

pub(crate) const DAEMON_UID: u32 = 501;
pub(crate) const DAEMON_GID: u32 = 20;

/// How the mock daemon answers one request.
pub(crate) enum Script {
    Reply(Vec<u8>),
    Empty,
    Errno(i32),
    /// Say nothing; the test answers later with `reply_to`, or never.
    NoReply,
}

impl Script {
    pub fn reply<T: WireEncode>(body: T) -> Self {
        Script::Reply(body.to_wire())
    }
}

#[derive(Default)]
struct Log {
    requests: Mutex<Vec<(InHeader, Bytes)>>,
    arrived: Condvar,
}

/// Daemon thread answering requests from a handler closure. Every decoded
/// request is logged, including the no-reply ones the handler never sees.
pub(crate) struct MockDaemon {
    log: Arc<Log>,
    replies: Arc<Mutex<Option<Sender<Bytes>>>>,
}

impl MockDaemon {
    pub fn spawn<F>(end: DaemonEnd, handler: F) -> Self
    where
        F: Fn(&InHeader, &Bytes) -> Script + Send + Sync + 'static,
    {
        let (requests, replier) = end.into_parts();
        let log = Arc::new(Log::default());
        let replies = Arc::new(Mutex::new(Some(replier)));
        {
            let log = Arc::clone(&log);
            let replies = Arc::clone(&replies);
            thread::Builder::new()
                .name("mock-daemon".into())
                .spawn(move || {
                    for frame in requests.iter() {
                        let Ok((header, payload)) = decode_request(&frame) else {
                            continue;
                        };
                        log.requests.lock().push((header, payload.clone()));
                        log.arrived.notify_all();
                        match header.opcode() {
                            Ok(op) if !op.is_noreply() => {}
                            _ => continue,
                        }
                        let (errno, body) = match handler(&header, &payload) {
                            Script::Reply(body) => (0, body),
                            Script::Empty => (0, Vec::new()),
                            Script::Errno(errno) => (errno, Vec::new()),
                            Script::NoReply => continue,
                        };
                        if let Some(tx) = replies.lock().as_ref() {
                            let _ = tx.send(OutHeader::frame(header.unique(), errno, &body));
                        }
                    }
                })
                .expect("spawn mock daemon");
        }
        Self { log, replies }
    }

    pub fn requests(&self) -> Vec<(InHeader, Bytes)> {
        self.log.requests.lock().clone()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.log
            .requests
            .lock()
            .iter()
            .filter(|(h, _)| h.opcode() == Ok(opcode))
            .count()
    }

    /// Block until `n` requests with `opcode` have arrived; returns them.
    pub fn wait_for(&self, opcode: Opcode, n: usize) -> Vec<(InHeader, Bytes)> {
        let deadline = Instant::now() + PATIENCE;
        let mut requests = self.log.requests.lock();
        loop {
            let matching: Vec<_> = requests
                .iter()
                .filter(|(h, _)| h.opcode() == Ok(opcode))
                .cloned()
                .collect();
            if matching.len() >= n {
                return matching;
            }
            if self.log.arrived.wait_until(&mut requests, deadline).timed_out() {
                panic!("timed out waiting for {n} {opcode} requests, saw {}", matching.len());
            }
        }
    }

    pub fn reply_to(&self, unique: u64, errno: i32, payload: &[u8]) {
        self.raw(OutHeader::frame(RequestId::from(unique), errno, payload));
    }

    /// Send an arbitrary frame as if it were a reply.
    pub fn raw(&self, frame: Bytes) {
        if let Some(tx) = self.replies.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Poll `cond` until it holds.
    pub fn settle(&self, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + PATIENCE;
        while !cond() {
            assert!(Instant::now() < deadline, "condition did not settle");
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Drop the reply channel; the bridge sees the daemon go away.
    pub fn disconnect(&self) {
        self.replies.lock().take();
    }
}

// ── Fixtures ────────────────────────────────────────────────────────────────

pub(crate) fn daemon_cred() -> Credential {
    Credential::new(Uid::from(DAEMON_UID), Gid::from(DAEMON_GID))
}

/// A caller matching the daemon's credential.
pub(crate) fn user_ctx() -> RequestContext {
    RequestContext::new(daemon_cred(), Pid::from(200))
}

pub(crate) fn test_session(flags: MountFlags, diag: Arc<MemorySink>) -> Session {
    Session::new(daemon_cred(), flags)
        .with_contract_policy(ContractPolicy::Report)
        .with_diagnostics(diag)
}

pub(crate) fn file_attr(ino: u64, size: u64) -> Attr {
    Attr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: 1_000,
        mtime: 1_000,
        ctime: 1_000,
        crtime: -1,
        mode: libc::S_IFREG as u32 | 0o644,
        nlink: 1,
        uid: DAEMON_UID,
        gid: DAEMON_GID,
        blksize: 4096,
        ..Attr::default()
    }
}

pub(crate) fn dir_attr(ino: u64) -> Attr {
    Attr {
        mode: libc::S_IFDIR as u32 | 0o755,
        nlink: 2,
        ..file_attr(ino, 0)
    }
}

pub(crate) fn attr_out(attr: Attr, ttl_sec: u64) -> AttrOut {
    AttrOut {
        attr_valid: ttl_sec,
        attr_valid_nsec: 0,
        dummy: 0,
        attr,
    }
}

pub(crate) fn entry_out(attr: Attr, ttl_sec: u64) -> EntryOut {
    EntryOut {
        nodeid: attr.ino,
        generation: 1,
        entry_valid: ttl_sec,
        attr_valid: ttl_sec,
        entry_valid_nsec: 0,
        attr_valid_nsec: 0,
        attr,
    }
}

pub(crate) fn dispatcher_with<F>(flags: MountFlags, handler: F) -> (Arc<Dispatcher>, MockDaemon)
where
    F: Fn(&InHeader, &Bytes) -> Script + Send + Sync + 'static,
{
    let session = Arc::new(test_session(flags, Arc::new(MemorySink::new())));
    let (transport, end) = ChannelTransport::pair();
    let transport = Arc::new(transport);
    let dispatcher = Arc::new(Dispatcher::new(session, Arc::clone(&transport) as _));
    transport
        .start(Arc::clone(&dispatcher) as _)
        .expect("start reader");
    (dispatcher, MockDaemon::spawn(end, handler))
}

/// Attribute cache over a scripted daemon, with a manual clock and a
/// recorder for content and change hooks.
pub(crate) struct AttrHarness {
    pub session: Arc<Session>,
    pub daemon: MockDaemon,
    pub clock: Arc<ManualClock>,
    pub changes: Arc<ChangeRecorder>,
    pub attrs: Arc<AttributeCache>,
}

pub(crate) fn attr_cache_with<F>(flags: MountFlags, handler: F) -> AttrHarness
where
    F: Fn(&InHeader, &Bytes) -> Script + Send + Sync + 'static,
{
    let (dispatcher, daemon) = dispatcher_with(flags, handler);
    let session = Arc::clone(dispatcher.session());
    let clock = Arc::new(ManualClock::new(Timespec::new(1_000, 0)));
    let changes = Arc::new(ChangeRecorder::new());
    let attrs = Arc::new(AttributeCache::new(
        Arc::clone(&session),
        dispatcher,
        Arc::clone(&clock) as _,
        Arc::clone(&changes) as _,
        Arc::clone(&changes) as _,
    ));
    AttrHarness {
        session,
        daemon,
        clock,
        changes,
        attrs,
    }
}

pub(crate) struct HandleHarness {
    pub session: Arc<Session>,
    pub daemon: MockDaemon,
    pub diag: Arc<MemorySink>,
    pub names: Arc<NameCache>,
    pub attrs: Arc<AttributeCache>,
    pub changes: Arc<ChangeRecorder>,
    pub table: FileHandleTable,
}

pub(crate) fn handle_table_with<F>(flags: MountFlags, handler: F) -> HandleHarness
where
    F: Fn(&InHeader, &Bytes) -> Script + Send + Sync + 'static,
{
    let diag = Arc::new(MemorySink::new());
    let session = Arc::new(test_session(flags, Arc::clone(&diag)));
    let (transport, end) = ChannelTransport::pair();
    let transport = Arc::new(transport);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&session), Arc::clone(&transport) as _));
    transport
        .start(Arc::clone(&dispatcher) as _)
        .expect("start reader");
    let daemon = MockDaemon::spawn(end, handler);

    let names = Arc::new(NameCache::new(&session));
    let changes = Arc::new(ChangeRecorder::new());
    let attrs = Arc::new(AttributeCache::new(
        Arc::clone(&session),
        Arc::clone(&dispatcher),
        Arc::new(ManualClock::default()),
        Arc::clone(&changes) as _,
        Arc::clone(&changes) as _,
    ));
    let table = FileHandleTable::new(
        Arc::clone(&session),
        dispatcher,
        Arc::clone(&names),
        Arc::clone(&attrs),
    );
    HandleHarness {
        session,
        daemon,
        diag,
        names,
        attrs,
        changes,
        table,
    }
}

/// A full bridge over a scripted daemon.
pub(crate) struct BridgeHarness {
    pub bridge: Arc<Bridge>,
    pub daemon: MockDaemon,
    pub diag: Arc<MemorySink>,
    pub clock: Arc<ManualClock>,
    pub changes: Arc<ChangeRecorder>,
}

pub(crate) fn bridge_with<F>(flags: MountFlags, handler: F) -> BridgeHarness
where
    F: Fn(&InHeader, &Bytes) -> Script + Send + Sync + 'static,
{
    let diag = Arc::new(MemorySink::new());
    let session = Arc::new(test_session(flags, Arc::clone(&diag)));
    let clock = Arc::new(ManualClock::new(Timespec::new(1_000, 0)));
    let changes = Arc::new(ChangeRecorder::new());
    let hooks = BridgeHooks {
        content: Arc::clone(&changes) as _,
        notifier: Arc::clone(&changes) as _,
        clock: Arc::clone(&clock) as _,
    };
    let (bridge, end) = Bridge::connect_channel(session, hooks).expect("connect bridge");
    bridge.mark_initialized();
    BridgeHarness {
        bridge: Arc::new(bridge),
        daemon: MockDaemon::spawn(end, handler),
        diag,
        clock,
        changes,
    }
}

