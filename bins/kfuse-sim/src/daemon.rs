//! In-memory daemon answering the bridge over the channel transport.

use std::collections::HashMap;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kfuse_core::config::CredentialConfig;
use kfuse_core::transport::DaemonEnd;
use kfuse_proto::header::decode_request;
use kfuse_proto::ops::{Attr, AttrOut, EntryOut, ForgetIn, OpenOut};
use kfuse_proto::{InHeader, Opcode, OutHeader, WireDecode, WireEncode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

const ROOT: u64 = 1;
const ATTR_TTL_SECS: u64 = 1;

pub struct DaemonOptions {
    pub owner: CredentialConfig,
    /// Fraction of requests answered after a short stall.
    pub slow_rate: f64,
    pub seed: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct DaemonSummary {
    pub requests: u64,
    pub replies: u64,
    pub forgets: u64,
    pub interrupts: u64,
    pub nodes: usize,
}

struct MemDaemon {
    opts: DaemonOptions,
    rng: StdRng,
    next_id: u64,
    next_fh: u64,
    attrs: HashMap<u64, Attr>,
    names: HashMap<(u64, String), u64>,
    lookups: HashMap<u64, u64>,
    summary: DaemonSummary,
}

pub fn spawn(end: DaemonEnd, opts: DaemonOptions) -> io::Result<JoinHandle<DaemonSummary>> {
    thread::Builder::new()
        .name("kfuse-sim-daemon".into())
        .spawn(move || MemDaemon::new(opts).run(end))
}

impl MemDaemon {
    fn new(opts: DaemonOptions) -> Self {
        let rng = StdRng::seed_from_u64(opts.seed);
        let mut daemon = Self {
            opts,
            rng,
            next_id: ROOT + 1,
            next_fh: 1,
            attrs: HashMap::new(),
            names: HashMap::new(),
            lookups: HashMap::new(),
            summary: DaemonSummary::default(),
        };
        let root = daemon.new_attr(ROOT, libc::S_IFDIR as u32 | 0o755);
        daemon.attrs.insert(ROOT, root);
        daemon
    }

    fn run(mut self, end: DaemonEnd) -> DaemonSummary {
        while let Some(frame) = end.recv() {
            self.summary.requests += 1;
            let (header, payload) = match decode_request(&frame) {
                Ok(parts) => parts,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable request");
                    continue;
                }
            };
            let opcode = match header.opcode() {
                Ok(op) if op.is_noreply() => {
                    self.absorb(op, &header, &payload);
                    continue;
                }
                Ok(op) => Some(op),
                Err(_) => None,
            };

            if self.rng.gen_bool(self.opts.slow_rate) {
                let stall = self.rng.gen_range(50..2_000);
                thread::sleep(Duration::from_micros(stall));
            }
            let (errno, body) = match opcode.map(|op| self.answer(op, &header, &payload)) {
                Some(Ok(body)) => (0, body),
                Some(Err(errno)) => (errno, Vec::new()),
                None => (libc::ENOSYS, Vec::new()),
            };
            if end.reply(OutHeader::frame(header.unique(), errno, &body)).is_err() {
                break;
            }
            self.summary.replies += 1;
        }
        self.summary.nodes = self.attrs.len();
        tracing::info!(requests = self.summary.requests, "daemon stopped");
        self.summary
    }

    fn absorb(&mut self, opcode: Opcode, header: &InHeader, payload: &[u8]) {
        match opcode {
            Opcode::Forget => {
                self.summary.forgets += 1;
                let Ok(forget) = ForgetIn::from_wire(payload) else {
                    return;
                };
                let node = header.node().get();
                if let Some(count) = self.lookups.get_mut(&node) {
                    *count = count.saturating_sub(forget.nlookup);
                }
            }
            Opcode::Interrupt => self.summary.interrupts += 1,
            _ => {}
        }
    }

    fn answer(&mut self, opcode: Opcode, header: &InHeader, payload: &[u8]) -> Result<Vec<u8>, i32> {
        let node = header.node().get();
        match opcode {
            Opcode::Init
            | Opcode::Flush
            | Opcode::Fsync
            | Opcode::Release
            | Opcode::Releasedir => Ok(Vec::new()),
            Opcode::Lookup => {
                let name = parse_name(payload)?;
                let id = *self.names.get(&(node, name)).ok_or(libc::ENOENT)?;
                Ok(self.entry(id)?.to_wire())
            }
            Opcode::Create => self.create(node, payload, libc::S_IFREG as u32 | 0o644),
            Opcode::Mkdir => self.create(node, payload, libc::S_IFDIR as u32 | 0o755),
            Opcode::Getattr => {
                let attr = *self.attrs.get(&node).ok_or(libc::ENOENT)?;
                Ok(AttrOut {
                    attr_valid: ATTR_TTL_SECS,
                    attr_valid_nsec: 0,
                    dummy: 0,
                    attr,
                }
                .to_wire())
            }
            Opcode::Open | Opcode::Opendir => {
                if !self.attrs.contains_key(&node) {
                    return Err(libc::ENOENT);
                }
                let fh = self.next_fh;
                self.next_fh += 1;
                Ok(OpenOut {
                    fh,
                    open_flags: 0,
                    padding: 0,
                }
                .to_wire())
            }
            _ => Err(libc::ENOSYS),
        }
    }

    fn create(&mut self, parent: u64, payload: &[u8], mode: u32) -> Result<Vec<u8>, i32> {
        let name = parse_name(payload)?;
        if self.names.contains_key(&(parent, name.clone())) {
            return Err(libc::EEXIST);
        }
        let id = self.next_id;
        self.next_id += 1;
        let attr = self.new_attr(id, mode);
        self.attrs.insert(id, attr);
        self.names.insert((parent, name), id);
        Ok(self.entry(id)?.to_wire())
    }

    fn entry(&mut self, id: u64) -> Result<EntryOut, i32> {
        let attr = *self.attrs.get(&id).ok_or(libc::ENOENT)?;
        *self.lookups.entry(id).or_default() += 1;
        Ok(EntryOut {
            nodeid: id,
            generation: 1,
            entry_valid: ATTR_TTL_SECS,
            attr_valid: ATTR_TTL_SECS,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr,
        })
    }

    fn new_attr(&self, ino: u64, mode: u32) -> Attr {
        Attr {
            ino,
            mode,
            nlink: if mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
                2
            } else {
                1
            },
            uid: self.opts.owner.uid,
            gid: self.opts.owner.gid,
            crtime: -1,
            blksize: 4096,
            ..Attr::default()
        }
    }
}

/// Requests carrying a name send it NUL-terminated.
fn parse_name(payload: &[u8]) -> Result<String, i32> {
    let end = payload.iter().position(|&b| b == 0).ok_or(libc::EINVAL)?;
    String::from_utf8(payload[..end].to_vec()).map_err(|_| libc::EINVAL)
}
