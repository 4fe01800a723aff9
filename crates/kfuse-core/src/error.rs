use kfuse_proto::{Opcode, WireError};
use kfuse_types::NodeId;
use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, FuseError>;

/// Failures surfaced at the node-operation boundary.
#[derive(Debug, Error)]
pub enum FuseError {
    /// The daemon broke the protocol for this one operation; the session
    /// stays usable.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),

    /// The node's identity is stale; its name-cache entries are purged.
    #[error("node {0} not found")]
    NotFound(NodeId),

    #[error("session is dead")]
    SessionDead,

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Caller-side misuse of the handle table. Only observable when the
    /// session runs with `ContractPolicy::Report`.
    #[error("contract violation on node {node}: {message}")]
    ContractViolation { node: NodeId, message: String },

    #[error("request interrupted")]
    Interrupted,

    #[error("{0} is not implemented by the daemon")]
    NotImplemented(Opcode),

    #[error("daemon failed {opcode} with errno {errno}")]
    Daemon { opcode: Opcode, errno: i32 },

    #[error("access denied")]
    AccessDenied,
}

impl FuseError {
    /// errno to hand back to the caller.
    pub fn errno(&self) -> i32 {
        match self {
            FuseError::Protocol(_) | FuseError::Wire(_) => libc::EIO,
            FuseError::NotFound(_) => libc::ENOENT,
            FuseError::SessionDead | FuseError::Transport(_) => libc::EIO,
            FuseError::ContractViolation { .. } => libc::EINVAL,
            FuseError::Interrupted => libc::EINTR,
            FuseError::NotImplemented(_) => libc::ENOSYS,
            FuseError::Daemon { errno, .. } => *errno,
            FuseError::AccessDenied => libc::EPERM,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, FuseError::Interrupted)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FuseError::NotFound(_))
    }

    /// True for errors after which the session can no longer be used.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, FuseError::SessionDead | FuseError::Transport(_))
    }
}
