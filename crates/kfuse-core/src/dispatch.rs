//! Request/reply multiplexing over one daemon channel.
//!
//! Every request gets a ticket with a fresh identifier. The issuing thread
//! blocks on the ticket's condition variable, holding no other lock, until
//! the reader thread delivers the matching reply, the session dies, or the
//! caller's interrupt token fires. Lock order is session → table → ticket;
//! the table lock is only held to insert, remove or drain.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use kfuse_proto::header::decode_reply;
use kfuse_proto::ops::{ForgetIn, InterruptIn};
use kfuse_proto::{InHeader, Opcode, WireDecode, WireEncode};
use kfuse_types::{NodeId, Pid, RequestId};
use parking_lot::{Condvar, Mutex};

use crate::diag::Severity;
use crate::error::{FuseError, Result};
use crate::session::{Credential, Session, SessionStats};
use crate::transport::{ReplySink, Transport};

// ── Request context ─────────────────────────────────────────────────────────

/// Who is asking, and how they can be interrupted.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub cred: Credential,
    pub pid: Pid,
    pub interrupt: Option<InterruptToken>,
}

impl RequestContext {
    pub fn new(cred: Credential, pid: Pid) -> Self {
        Self {
            cred,
            pid,
            interrupt: None,
        }
    }

    /// The kernel acting on its own behalf.
    pub fn kernel() -> Self {
        Self::new(Credential::root(), Pid::KERNEL)
    }

    pub fn with_interrupt(mut self, token: InterruptToken) -> Self {
        self.interrupt = Some(token);
        self
    }

    /// Same caller, but the wait cannot be cut short.
    pub fn uninterruptible(&self) -> Self {
        Self {
            cred: self.cred,
            pid: self.pid,
            interrupt: None,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.cred.is_privileged()
    }

    fn is_interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(InterruptToken::is_fired)
    }
}

/// Signal-equivalent for a blocked caller. Cloning shares the signal.
#[derive(Clone, Default)]
pub struct InterruptToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    fired: AtomicBool,
    /// Ticket the owner is currently blocked on.
    armed: Mutex<Option<Arc<Ticket>>>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Interrupt the owner's current (or next) wait.
    pub fn fire(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        let armed = self.inner.armed.lock().clone();
        if let Some(ticket) = armed {
            // Taking the ticket lock orders this wakeup after the waiter's
            // check of `fired`.
            let _state = ticket.state.lock();
            ticket.cond.notify_all();
        }
    }

    pub fn reset(&self) {
        self.inner.fired.store(false, Ordering::SeqCst);
    }

    fn arm(&self, ticket: &Arc<Ticket>) {
        *self.inner.armed.lock() = Some(Arc::clone(ticket));
    }

    fn disarm(&self) {
        self.inner.armed.lock().take();
    }
}

impl fmt::Debug for InterruptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptToken")
            .field("fired", &self.is_fired())
            .finish()
    }
}

// ── Tickets ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum TicketState {
    Pending,
    Answered { errno: i32, payload: Bytes },
    /// The caller gave up; a late reply is swallowed.
    Interrupted,
    /// The session died underneath the request.
    Aborted,
}

struct Ticket {
    unique: RequestId,
    opcode: Opcode,
    node: NodeId,
    state: Mutex<TicketState>,
    cond: Condvar,
}

/// Releases the caller's hold on a ticket when dropped. Exactly one guard
/// exists per ticket, so release happens exactly once on every path.
struct TicketGuard {
    session: Arc<Session>,
    unique: RequestId,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        self.session.stats().tickets_live.dec();
        tracing::trace!(unique = %self.unique, "ticket released");
    }
}

/// Counts the caller as blocked for as long as it lives.
struct InFlight<'a>(&'a SessionStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a SessionStats) -> Self {
        stats.in_flight.inc();
        InFlight(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.dec();
    }
}

/// A successful daemon reply. Dropping it releases the ticket.
pub struct Reply {
    opcode: Opcode,
    payload: Bytes,
    guard: TicketGuard,
}

impl Reply {
    pub fn unique(&self) -> RequestId {
        self.guard.unique
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn decode<T: WireDecode>(&self) -> Result<T> {
        T::from_wire(&self.payload).map_err(FuseError::from)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("unique", &self.guard.unique)
            .field("opcode", &self.opcode)
            .field("len", &self.payload.len())
            .finish()
    }
}

#[derive(Debug)]
pub enum Outcome {
    Answered(Reply),
    /// The caller's interrupt fired first; the daemon has been told.
    Interrupted,
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

/// Interrupted tickets kept around to recognize a late reply. Past this,
/// the oldest are forgotten and their replies count as anomalies.
pub const INTERRUPTED_BACKLOG: usize = 256;

pub struct Dispatcher {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    next_unique: AtomicU64,
    tickets: Mutex<HashMap<RequestId, Arc<Ticket>>>,
    /// Interrupted identifiers, oldest first.
    interrupted: Mutex<VecDeque<RequestId>>,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>, transport: Arc<dyn Transport>) -> Self {
        Self {
            session,
            transport,
            next_unique: AtomicU64::new(1),
            tickets: Mutex::new(HashMap::new()),
            interrupted: Mutex::new(VecDeque::new()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn alloc_unique(&self) -> RequestId {
        RequestId::from(self.next_unique.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_implemented(&self, opcode: Opcode) -> bool {
        self.session.is_implemented(opcode)
    }

    pub fn mark_unimplemented(&self, opcode: Opcode) {
        self.session.mark_unimplemented(opcode)
    }

    /// Tickets still tracked (pending, or interrupted awaiting a late reply).
    pub fn pending(&self) -> usize {
        self.tickets.lock().len()
    }

    /// Send a request and block until it is answered, interrupted or
    /// abandoned because the session died.
    pub fn send(
        &self,
        ctx: &RequestContext,
        opcode: Opcode,
        node: NodeId,
        payload: &[u8],
    ) -> Result<Outcome> {
        if opcode.is_noreply() {
            return Err(FuseError::Protocol(format!(
                "{opcode} never gets a reply and cannot be waited on"
            )));
        }
        if !self.session.is_implemented(opcode) {
            return Err(FuseError::NotImplemented(opcode));
        }
        if self.session.is_dead() {
            return Err(FuseError::SessionDead);
        }

        let unique = self.alloc_unique();
        let ticket = Arc::new(Ticket {
            unique,
            opcode,
            node,
            state: Mutex::new(TicketState::Pending),
            cond: Condvar::new(),
        });
        self.tickets.lock().insert(unique, Arc::clone(&ticket));
        // A teardown that drained the table before the insert has already
        // marked the session dead.
        if self.session.is_dead() {
            self.tickets.lock().remove(&unique);
            return Err(FuseError::SessionDead);
        }
        self.session.stats().tickets_live.inc();
        let guard = TicketGuard {
            session: Arc::clone(&self.session),
            unique,
        };
        let _in_flight = InFlight::enter(self.session.stats());

        let frame = InHeader::new(opcode, unique, node, ctx.cred.uid, ctx.cred.gid, ctx.pid)
            .frame(payload);
        tracing::trace!(%unique, %opcode, node = %node, "sending request");
        if let Err(e) = self.transport.send(frame) {
            self.tickets.lock().remove(&unique);
            self.fail_session(&format!("request write failed: {e}"));
            return Err(FuseError::Transport(e));
        }

        if let Some(token) = &ctx.interrupt {
            token.arm(&ticket);
        }
        let waited = self.wait(ctx, &ticket);
        if let Some(token) = &ctx.interrupt {
            token.disarm();
        }

        match waited {
            Waited::Answered { errno: 0, payload } => Ok(Outcome::Answered(Reply {
                opcode,
                payload,
                guard,
            })),
            Waited::Answered { errno, .. } => Err(self.daemon_error(opcode, node, errno)),
            Waited::Interrupted => {
                self.send_interrupt(ctx, &ticket);
                self.retain_interrupted(unique);
                Ok(Outcome::Interrupted)
            }
            Waited::Dead => {
                self.tickets.lock().remove(&unique);
                Err(FuseError::SessionDead)
            }
        }
    }

    /// `send`, treating interruption as an error and decoding the payload.
    pub fn call<T: WireDecode>(
        &self,
        ctx: &RequestContext,
        opcode: Opcode,
        node: NodeId,
        payload: &[u8],
    ) -> Result<T> {
        match self.send(ctx, opcode, node, payload)? {
            Outcome::Answered(reply) => reply.decode(),
            Outcome::Interrupted => Err(FuseError::Interrupted),
        }
    }

    /// `call` for replies that carry no payload.
    pub fn call_empty(
        &self,
        ctx: &RequestContext,
        opcode: Opcode,
        node: NodeId,
        payload: &[u8],
    ) -> Result<()> {
        match self.send(ctx, opcode, node, payload)? {
            Outcome::Answered(_) => Ok(()),
            Outcome::Interrupted => Err(FuseError::Interrupted),
        }
    }

    fn wait(&self, ctx: &RequestContext, ticket: &Ticket) -> Waited {
        let mut state = ticket.state.lock();
        loop {
            match &*state {
                TicketState::Answered { errno, payload } => {
                    return Waited::Answered {
                        errno: *errno,
                        payload: payload.clone(),
                    }
                }
                TicketState::Aborted => return Waited::Dead,
                TicketState::Interrupted | TicketState::Pending => {}
            }
            if self.session.is_dead() {
                return Waited::Dead;
            }
            if ctx.is_interrupted() {
                *state = TicketState::Interrupted;
                return Waited::Interrupted;
            }
            ticket.cond.wait(&mut state);
        }
    }

    fn daemon_error(&self, opcode: Opcode, node: NodeId, errno: i32) -> FuseError {
        match errno {
            libc::ENOENT => FuseError::NotFound(node),
            libc::ENOSYS => FuseError::NotImplemented(opcode),
            errno => FuseError::Daemon { opcode, errno },
        }
    }

    /// The interrupted ticket stays in the table so its late reply is
    /// recognized and discarded.
    fn send_interrupt(&self, ctx: &RequestContext, ticket: &Ticket) {
        tracing::debug!(unique = %ticket.unique, opcode = %ticket.opcode, "interrupting request");
        let payload = InterruptIn::new(ticket.unique).to_wire();
        match self.send_noreply(ctx, Opcode::Interrupt, ticket.node, &payload) {
            Ok(()) => self.session.stats().interrupts_sent.inc(),
            Err(e) => tracing::debug!(unique = %ticket.unique, error = %e, "interrupt not sent"),
        }
    }

    /// Keep `unique` for late-reply recognition, forgetting the oldest
    /// interrupted ticket once the backlog is full.
    fn retain_interrupted(&self, unique: RequestId) {
        let evicted = {
            let mut backlog = self.interrupted.lock();
            backlog.push_back(unique);
            if backlog.len() > INTERRUPTED_BACKLOG {
                backlog.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            if self.tickets.lock().remove(&old).is_some() {
                tracing::debug!(unique = %old, "forgetting unanswered interrupted request");
            }
        }
    }

    /// Fire-and-forget request (FORGET, INTERRUPT): fresh identifier, no
    /// ticket, no reply expected.
    pub fn send_noreply(
        &self,
        ctx: &RequestContext,
        opcode: Opcode,
        node: NodeId,
        payload: &[u8],
    ) -> Result<()> {
        debug_assert!(opcode.is_noreply(), "{opcode} expects a reply");
        if self.session.is_dead() {
            return Err(FuseError::SessionDead);
        }
        let unique = self.alloc_unique();
        let frame = InHeader::new(opcode, unique, node, ctx.cred.uid, ctx.cred.gid, ctx.pid)
            .frame(payload);
        self.transport.send(frame).map_err(|e| {
            self.fail_session(&format!("{opcode} write failed: {e}"));
            FuseError::Transport(e)
        })
    }

    /// Forget `nlookup` lookups of `node`.
    pub fn send_forget(&self, node: NodeId, nlookup: u64) -> Result<()> {
        let payload = ForgetIn { nlookup }.to_wire();
        self.send_noreply(&RequestContext::kernel(), Opcode::Forget, node, &payload)?;
        self.session.stats().forgets_sent.inc();
        Ok(())
    }

    /// Wake every waiter with "session gone" and forget all tickets.
    pub fn abort_all(&self) {
        let drained: Vec<Arc<Ticket>> = self.tickets.lock().drain().map(|(_, t)| t).collect();
        self.interrupted.lock().clear();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "aborting outstanding requests");
        }
        for ticket in drained {
            let mut state = ticket.state.lock();
            if matches!(*state, TicketState::Pending) {
                *state = TicketState::Aborted;
            }
            ticket.cond.notify_all();
        }
    }

    fn fail_session(&self, reason: &str) {
        if self.session.mark_dead() {
            self.session.diag().record(Severity::Critical, None, reason);
        }
        self.abort_all();
    }

    fn anomaly(&self, message: &str) {
        self.session.stats().anomalies.inc();
        self.session.diag().record(Severity::Warning, None, message);
    }
}

enum Waited {
    Answered { errno: i32, payload: Bytes },
    Interrupted,
    Dead,
}

impl ReplySink for Dispatcher {
    fn deliver(&self, frame: Bytes) {
        let (header, payload) = match decode_reply(&frame) {
            Ok(parts) => parts,
            Err(e) => {
                self.anomaly(&format!("dropping malformed reply: {e}"));
                return;
            }
        };
        let unique = header.unique();
        let removed = self.tickets.lock().remove(&unique);
        let Some(ticket) = removed else {
            self.anomaly(&format!("reply for unknown request {unique}"));
            return;
        };

        let errno = header.errno();
        let mut fatal = false;
        if errno == libc::ENOSYS {
            if ticket.opcode.is_mandatory() {
                fatal = true;
            } else {
                self.session.mark_unimplemented(ticket.opcode);
            }
        }

        let killed = {
            let mut state = ticket.state.lock();
            // Dead flag and answer become visible to the waiter together.
            let killed = fatal && self.session.mark_dead();
            match *state {
                TicketState::Pending => {
                    *state = TicketState::Answered { errno, payload };
                    ticket.cond.notify_all();
                }
                TicketState::Interrupted => {
                    tracing::debug!(%unique, errno, "discarding reply to interrupted request");
                }
                TicketState::Answered { .. } | TicketState::Aborted => {}
            }
            killed
        };

        if fatal {
            if killed {
                self.session.diag().record(
                    Severity::Critical,
                    None,
                    &format!("daemon does not implement mandatory opcode {}", ticket.opcode),
                );
            }
            self.abort_all();
        }
    }

    fn channel_lost(&self) {
        self.fail_session("daemon channel lost");
    }
}
