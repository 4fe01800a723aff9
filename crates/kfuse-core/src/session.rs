//! Per-mount session state: daemon credential, mount options, liveness,
//! negotiated capabilities and counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use kfuse_proto::Opcode;
use kfuse_types::{Gid, NodeId, Uid};
use serde::Serialize;

use crate::config::{BridgeConfig, ContractPolicy, IOSIZE_CEILING};
use crate::diag::{DiagnosticSink, Severity, TracingSink};
use crate::error::FuseError;
use crate::node::Node;

bitflags! {
    /// Mount options in effect for a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        const ALLOW_OTHER         = 1 << 0;
        const ALLOW_ROOT          = 1 << 1;
        /// Trust cached content across externally visible modification.
        const KEEP_CACHE          = 1 << 2;
        const DIRECT_IO           = 1 << 3;
        const NO_ATTRCACHE        = 1 << 4;
        /// Skip the write-back of buffered content on the last close.
        const NO_SYNCONCLOSE      = 1 << 5;
        /// Asynchronous writes: the local size is authoritative.
        const NO_SYNCWRITES       = 1 << 6;
        const NEGATIVE_VNCACHE    = 1 << 7;
        const NO_VNCACHE          = 1 << 8;
        const XTIMES              = 1 << 9;
        const SPARSE              = 1 << 10;
        const NO_APPLEDOUBLE      = 1 << 11;
    }
}

/// Caller or daemon identity. Only `uid` and `gid` take part in access
/// decisions; the real ids are carried for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credential {
    pub uid: Uid,
    pub gid: Gid,
    pub ruid: Uid,
    pub rgid: Gid,
}

impl Credential {
    pub fn new(uid: Uid, gid: Gid) -> Self {
        Self {
            uid,
            gid,
            ruid: uid,
            rgid: gid,
        }
    }

    pub fn root() -> Self {
        Self::new(Uid::ROOT, Gid::from(0))
    }

    pub fn with_real(mut self, ruid: Uid, rgid: Gid) -> Self {
        self.ruid = ruid;
        self.rgid = rgid;
        self
    }

    pub fn is_privileged(&self) -> bool {
        self.uid.is_root()
    }
}

// ── Counters ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Session-owned observability counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Callers currently blocked waiting for a reply.
    pub in_flight: Counter,
    /// Tickets allocated and not yet released.
    pub tickets_live: Counter,
    /// Open exchanges attempted.
    pub fh_upcalls: Counter,
    /// Daemon handles currently held.
    pub fh_current: Counter,
    /// Replies that matched no live request, or failed to decode.
    pub anomalies: Counter,
    pub interrupts_sent: Counter,
    pub forgets_sent: Counter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub in_flight: u64,
    pub tickets_live: u64,
    pub fh_upcalls: u64,
    pub fh_current: u64,
    pub anomalies: u64,
    pub interrupts_sent: u64,
    pub forgets_sent: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            in_flight: self.in_flight.get(),
            tickets_live: self.tickets_live.get(),
            fh_upcalls: self.fh_upcalls.get(),
            fh_current: self.fh_current.get(),
            anomalies: self.anomalies.get(),
            interrupts_sent: self.interrupts_sent.get(),
            forgets_sent: self.forgets_sent.get(),
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────────────

pub struct Session {
    daemon_cred: Credential,
    flags: MountFlags,
    dead: AtomicBool,
    inited: AtomicBool,
    noimplflags: AtomicU64,
    iosize: u32,
    clock_granularity: Duration,
    contract_policy: ContractPolicy,
    stats: SessionStats,
    diag: Arc<dyn DiagnosticSink>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("daemon_cred", &self.daemon_cred)
            .field("flags", &self.flags)
            .field("dead", &self.is_dead())
            .field("inited", &self.is_inited())
            .field("iosize", &self.iosize)
            .finish_non_exhaustive()
    }
}

/// Round `size` up to a power of two (starting at 512, clipping at 2 GiB),
/// then clamp into `[min, max]`. Swapped bounds are put back in order.
pub fn round_iosize(size: u32, min: u32, max: u32) -> u32 {
    let (min, max) = if min <= max { (min, max) } else { (max, min) };
    let size = size & (IOSIZE_CEILING - 1);
    let mut candidate: u32 = 512;
    while candidate < size {
        candidate <<= 1;
    }
    candidate.clamp(min, max)
}

impl Session {
    pub fn new(daemon_cred: Credential, flags: MountFlags) -> Self {
        Self {
            daemon_cred,
            flags,
            dead: AtomicBool::new(false),
            inited: AtomicBool::new(false),
            noimplflags: AtomicU64::new(0),
            iosize: 64 * 1024,
            clock_granularity: Duration::from_micros(1),
            contract_policy: ContractPolicy::default(),
            stats: SessionStats::default(),
            diag: Arc::new(TracingSink),
        }
    }

    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self::new(cfg.daemon.credential(), cfg.mount_flags())
            .with_iosize(round_iosize(cfg.iosize, cfg.min_iosize, cfg.max_iosize))
            .with_clock_granularity(cfg.clock_granularity())
            .with_contract_policy(cfg.contract_violation)
    }

    pub fn with_iosize(mut self, iosize: u32) -> Self {
        self.iosize = iosize;
        self
    }

    pub fn with_clock_granularity(mut self, granularity: Duration) -> Self {
        self.clock_granularity = granularity;
        self
    }

    pub fn with_contract_policy(mut self, policy: ContractPolicy) -> Self {
        self.contract_policy = policy;
        self
    }

    pub fn with_diagnostics(mut self, diag: Arc<dyn DiagnosticSink>) -> Self {
        self.diag = diag;
        self
    }

    pub fn daemon_cred(&self) -> &Credential {
        &self.daemon_cred
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn has(&self, flag: MountFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn iosize(&self) -> u32 {
        self.iosize
    }

    pub fn clock_granularity(&self) -> Duration {
        self.clock_granularity
    }

    pub fn contract_policy(&self) -> ContractPolicy {
        self.contract_policy
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn diag(&self) -> &dyn DiagnosticSink {
        self.diag.as_ref()
    }

    // ── Liveness ────────────────────────────────────────────────────────────

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Returns true if this call is the one that killed the session.
    /// Blocked callers are not woken here; that is the dispatcher's
    /// `abort_all`, which every path killing a session runs next.
    pub(crate) fn mark_dead(&self) -> bool {
        let first = !self.dead.swap(true, Ordering::SeqCst);
        if first {
            tracing::warn!("session marked dead");
        }
        first
    }

    pub fn is_inited(&self) -> bool {
        self.inited.load(Ordering::SeqCst)
    }

    pub fn mark_initialized(&self) {
        self.inited.store(true, Ordering::SeqCst);
    }

    // ── Capabilities ────────────────────────────────────────────────────────

    pub fn is_implemented(&self, opcode: Opcode) -> bool {
        match opcode.capability_bit() {
            Some(bit) => self.noimplflags.load(Ordering::Acquire) & bit == 0,
            None => true,
        }
    }

    /// Record that the daemon does not implement `opcode`. Mandatory
    /// opcodes have no capability bit and are left alone.
    pub fn mark_unimplemented(&self, opcode: Opcode) {
        if let Some(bit) = opcode.capability_bit() {
            let prev = self.noimplflags.fetch_or(bit, Ordering::AcqRel);
            if prev & bit == 0 {
                tracing::info!(%opcode, "daemon does not implement opcode");
            }
        }
    }

    // ── Derived mount predicates ────────────────────────────────────────────

    pub fn is_direct_io(&self, node: &Node) -> bool {
        self.has(MountFlags::DIRECT_IO) || node.is_direct_io()
    }

    pub fn is_no_attrcache(&self) -> bool {
        self.has(MountFlags::NO_ATTRCACHE)
    }

    pub fn is_no_sync_on_close(&self, node: &Node) -> bool {
        !self.is_direct_io(node) && self.has(MountFlags::NO_SYNCONCLOSE)
    }

    /// Asynchronous-write mode: the locally tracked size wins.
    pub fn is_async_writes(&self) -> bool {
        self.has(MountFlags::NO_SYNCWRITES) && !self.has(MountFlags::DIRECT_IO)
    }

    pub fn is_no_vncache(&self) -> bool {
        self.has(MountFlags::NO_VNCACHE)
    }

    pub fn is_keep_cache(&self) -> bool {
        self.has(MountFlags::KEEP_CACHE)
    }

    pub fn is_sparse(&self) -> bool {
        self.has(MountFlags::SPARSE)
    }

    /// AppleDouble (`._*`) and `.DS_Store` names are hidden when
    /// `NO_APPLEDOUBLE` is set. A bare `._` is still allowed.
    pub fn skips_name(&self, name: &str) -> bool {
        self.has(MountFlags::NO_APPLEDOUBLE)
            && name.len() > 2
            && (name == ".DS_Store" || name.starts_with("._"))
    }

    // ── Contract checks ─────────────────────────────────────────────────────

    /// Report a caller-side misuse. Panics under `ContractPolicy::Panic`,
    /// otherwise returns the error to hand back.
    pub fn contract_violation(&self, node: NodeId, message: String) -> FuseError {
        self.diag.record(Severity::Critical, Some(node), &message);
        match self.contract_policy {
            ContractPolicy::Panic => panic!("contract violation on node {node}: {message}"),
            ContractPolicy::Report => FuseError::ContractViolation { node, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;

    fn node(direct_io: bool) -> Node {
        let n = Node::new(NodeId::from(5), NodeKind::Regular, NodeId::ROOT, 0);
        n.set_direct_io(direct_io);
        n
    }

    #[test]
    fn test_round_iosize() {
        assert_eq!(round_iosize(0, 512, 1 << 20), 512);
        assert_eq!(round_iosize(513, 512, 1 << 20), 1024);
        assert_eq!(round_iosize(4096, 512, 1 << 20), 4096);
        assert_eq!(round_iosize(100_000, 4096, 1 << 20), 131_072);
        assert_eq!(round_iosize(1000, 4096, 1 << 20), 4096);
        assert_eq!(round_iosize(u32::MAX, 512, 1 << 20), 1 << 20);
    }

    #[test]
    fn test_round_iosize_with_swapped_bounds() {
        assert_eq!(round_iosize(1000, 1 << 20, 4096), 4096);
        assert_eq!(round_iosize(1 << 21, 1 << 20, 4096), 1 << 20);
    }

    #[test]
    fn test_capability_bits() {
        let s = Session::new(Credential::root(), MountFlags::empty());
        assert!(s.is_implemented(Opcode::Getxtimes));
        s.mark_unimplemented(Opcode::Getxtimes);
        assert!(!s.is_implemented(Opcode::Getxtimes));
        assert!(s.is_implemented(Opcode::Exchange));

        s.mark_unimplemented(Opcode::Open);
        assert!(s.is_implemented(Opcode::Open));
    }

    #[test]
    fn test_mark_dead_reports_first_transition() {
        let s = Session::new(Credential::root(), MountFlags::empty());
        assert!(!s.is_dead());
        assert!(s.mark_dead());
        assert!(!s.mark_dead());
        assert!(s.is_dead());
    }

    #[test]
    fn test_async_writes_requires_no_direct_io() {
        let s = Session::new(Credential::root(), MountFlags::NO_SYNCWRITES);
        assert!(s.is_async_writes());
        let s = Session::new(
            Credential::root(),
            MountFlags::NO_SYNCWRITES | MountFlags::DIRECT_IO,
        );
        assert!(!s.is_async_writes());
    }

    #[test]
    fn test_direct_io_predicates() {
        let s = Session::new(Credential::root(), MountFlags::NO_SYNCONCLOSE);
        assert!(!s.is_direct_io(&node(false)));
        assert!(s.is_direct_io(&node(true)));
        assert!(s.is_no_sync_on_close(&node(false)));
        assert!(!s.is_no_sync_on_close(&node(true)));
    }

    #[test]
    fn test_skips_name() {
        let s = Session::new(Credential::root(), MountFlags::NO_APPLEDOUBLE);
        assert!(s.skips_name("._foo"));
        assert!(s.skips_name(".DS_Store"));
        assert!(!s.skips_name("._"));
        assert!(!s.skips_name("foo"));
        let s = Session::new(Credential::root(), MountFlags::empty());
        assert!(!s.skips_name("._foo"));
    }

    #[test]
    fn test_contract_violation_report() {
        let s = Session::new(Credential::root(), MountFlags::empty())
            .with_contract_policy(ContractPolicy::Report);
        let err = s.contract_violation(NodeId::from(4), "double release".into());
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    #[should_panic(expected = "contract violation on node 4")]
    fn test_contract_violation_panics_by_default() {
        let s = Session::new(Credential::root(), MountFlags::empty());
        let _ = s.contract_violation(NodeId::from(4), "double release".into());
    }

    #[test]
    fn test_from_config_rounds_iosize() {
        let cfg = BridgeConfig::from_toml_str("iosize = 5000").unwrap();
        let s = Session::from_config(&cfg);
        assert_eq!(s.iosize(), 8192);
    }
}
