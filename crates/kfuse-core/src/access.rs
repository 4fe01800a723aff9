//! Which callers may touch a session's nodes.

use kfuse_types::{NodeId, Pid};

use crate::dispatch::RequestContext;
use crate::error::{FuseError, Result};
use crate::session::{MountFlags, Session};

/// Caller admission for a mounted session.
///
/// Rules, first match wins:
/// 1. `allow_other` admits everyone.
/// 2. `allow_root` admits uid 0.
/// 3. A caller whose effective uid and gid equal the daemon's.
/// 4. Before INIT completes, a privileged caller on the root node.
/// 5. After the session died, anyone on the root node (so unmount works).
/// 6. The kernel itself (pid 0).
///
/// Real, saved and supplementary ids are not consulted.
pub struct AccessGuard;

impl AccessGuard {
    pub fn permit(node: NodeId, session: &Session, ctx: &RequestContext) -> bool {
        let cred = &ctx.cred;
        let daemon = session.daemon_cred();

        if session.has(MountFlags::ALLOW_OTHER) {
            return true;
        }
        if session.has(MountFlags::ALLOW_ROOT) && cred.is_privileged() {
            return true;
        }
        if cred.uid == daemon.uid && cred.gid == daemon.gid {
            return true;
        }
        if !session.is_inited() && node.is_root() && cred.is_privileged() {
            return true;
        }
        if session.is_dead() && node.is_root() {
            return true;
        }
        ctx.pid == Pid::KERNEL
    }

    pub fn check(node: NodeId, session: &Session, ctx: &RequestContext) -> Result<()> {
        if Self::permit(node, session, ctx) {
            Ok(())
        } else {
            tracing::debug!(node = %node, uid = %ctx.cred.uid, pid = %ctx.pid, "access denied");
            Err(FuseError::AccessDenied)
        }
    }
}
