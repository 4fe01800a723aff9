//! Concurrent operation mix run against a bridge.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kfuse_core::{Bridge, FuseError, HandleMode, InterruptToken, NodeKind, RequestContext};
use kfuse_proto::Opcode;
use kfuse_types::{NodeId, Pid};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

pub struct WorkloadOptions {
    pub threads: usize,
    pub ops: usize,
    pub interrupt_rate: f64,
    pub seed: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct WorkloadReport {
    pub completed: u64,
    pub interrupted: u64,
    /// Failures keyed by errno.
    pub errors: BTreeMap<i32, u64>,
}

impl WorkloadReport {
    fn record<T>(&mut self, result: Result<T, FuseError>) {
        match result {
            Ok(_) => self.completed += 1,
            Err(e) if e.is_interrupted() => self.interrupted += 1,
            Err(e) => *self.errors.entry(e.errno()).or_default() += 1,
        }
    }

    fn absorb(&mut self, other: WorkloadReport) {
        self.completed += other.completed;
        self.interrupted += other.interrupted;
        for (errno, n) in other.errors {
            *self.errors.entry(errno).or_default() += n;
        }
    }
}

fn caller(bridge: &Bridge, pid: u32) -> RequestContext {
    RequestContext::new(*bridge.session().daemon_cred(), Pid::from(pid))
}

/// Complete INIT and populate the root with `files` regular files.
pub fn prepare(bridge: &Bridge, files: usize) -> kfuse_core::Result<Vec<(NodeId, String)>> {
    let ctx = caller(bridge, 1);
    bridge.dispatch(&ctx, Opcode::Init, NodeId::ROOT, &[])?;
    bridge.mark_initialized();

    let mut nodes = Vec::with_capacity(files);
    for i in 0..files {
        let name = format!("file-{i:04}");
        let mut payload = name.clone().into_bytes();
        payload.push(0);
        let node = bridge.create_entry(&ctx, NodeId::ROOT, &name, Opcode::Create, &payload, NodeKind::Regular)?;
        nodes.push((node.id(), name));
    }
    tracing::info!(files, "namespace prepared");
    Ok(nodes)
}

pub fn run(bridge: &Arc<Bridge>, nodes: &[(NodeId, String)], opts: &WorkloadOptions) -> WorkloadReport {
    let per_thread = opts.ops / opts.threads.max(1);
    let nodes: Arc<Vec<(NodeId, String)>> = Arc::new(nodes.to_vec());
    let workers: Vec<_> = (0..opts.threads)
        .map(|t| {
            let bridge = Arc::clone(bridge);
            let nodes = Arc::clone(&nodes);
            let seed = opts.seed.wrapping_add(t as u64);
            let rate = opts.interrupt_rate;
            thread::spawn(move || worker(&bridge, &nodes, per_thread, rate, seed, 100 + t as u32))
        })
        .collect();

    let mut report = WorkloadReport::default();
    for w in workers {
        match w.join() {
            Ok(part) => report.absorb(part),
            Err(_) => tracing::error!("worker panicked"),
        }
    }
    report
}

fn worker(bridge: &Bridge, nodes: &[(NodeId, String)], ops: usize, rate: f64, seed: u64, pid: u32) -> WorkloadReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = WorkloadReport::default();
    if nodes.is_empty() {
        return report;
    }
    let base = caller(bridge, pid);

    for _ in 0..ops {
        let (id, name) = &nodes[rng.gen_range(0..nodes.len())];
        let id = *id;
        match rng.gen_range(0..7) {
            0 => report.record(bridge.read_attributes(&base, id)),
            1 => {
                let flags = if rng.gen_bool(0.5) { libc::O_RDONLY } else { libc::O_RDWR };
                let opened = bridge.open_handle(&base, id, flags);
                if opened.is_ok() {
                    let mode = HandleMode::from_open_flags(flags);
                    report.record(bridge.close_handle(&base, id, mode));
                } else {
                    report.record(opened);
                }
            }
            2 => report.record(bridge.lookup(&base, NodeId::ROOT, name)),
            3 => report.record(bridge.set_local_size(&base, id, rng.gen_range(0..1 << 20))),
            4 => {
                let token = InterruptToken::new();
                let ctx = base.clone().with_interrupt(token.clone());
                if rng.gen_bool(rate) {
                    let delay = rng.gen_range(0..500);
                    thread::spawn(move || {
                        thread::sleep(Duration::from_micros(delay));
                        token.fire();
                    });
                }
                report.record(bridge.dispatch(&ctx, Opcode::Flush, id, &[]));
            }
            5 => report.record(bridge.read_xtimes(&base, id)),
            _ => report.record(bridge.invalidate_attributes(&base, id)),
        }
    }
    report
}
