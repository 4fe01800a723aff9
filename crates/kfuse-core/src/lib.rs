//! Kernel-side core of a FUSE bridge.
//!
//! Operations issued against local nodes are relayed to a user-space daemon
//! through a [`Dispatcher`], which multiplexes concurrent requests over a
//! single [`Transport`]. Per-node state (open handles, cached attributes,
//! name associations) is reconciled with the daemon's replies. [`Bridge`]
//! ties the pieces together behind the node-operation boundary.

pub mod access;
pub mod attr;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod diag;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod name_cache;
pub mod node;
pub mod notify;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use access::AccessGuard;
pub use attr::{AttrSnapshot, AttributeCache, ExtendedTimes, FieldPolicy, MergePolicy};
pub use bridge::{Bridge, BridgeHooks};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{BridgeConfig, ConfigError, ContractPolicy, MountOption};
pub use diag::{DiagnosticSink, MemorySink, Severity, TracingSink};
pub use dispatch::{Dispatcher, InterruptToken, Outcome, Reply, RequestContext};
pub use error::{FuseError, Result};
pub use handle::{FileHandleTable, HandleMode, OpenHandle};
pub use name_cache::{NameCache, NameLookup};
pub use node::{Node, NodeKind, NodeTable};
pub use notify::{ChangeHint, ChangeNotifier, ChangeRecorder, ContentCache, NoopHooks};
pub use session::{Credential, MountFlags, Session, SessionStats, StatsSnapshot};
pub use transport::{ChannelTransport, DaemonEnd, ReplySink, Transport, TransportError};
