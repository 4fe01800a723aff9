strong_type!(
    /// Daemon-assigned identity of a filesystem node.
    NodeId,
    u64
);
strong_type!(
    /// Identifier of one request/reply exchange ("unique" on the wire).
    RequestId,
    u64
);
strong_type!(
    /// Daemon-side open handle.
    FileHandleId,
    u64
);
strong_type!(Uid, u32);
strong_type!(Gid, u32);
strong_type!(Pid, u32);

impl NodeId {
    /// Reserved "no node" identity.
    pub const NULL: NodeId = NodeId(0);
    /// Identity of the session root.
    pub const ROOT: NodeId = NodeId(1);

    /// True for identities that can never be handed out for a new entry.
    pub fn is_reserved(self) -> bool {
        self == Self::NULL || self == Self::ROOT
    }

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl Uid {
    /// The superuser.
    pub const ROOT: Uid = Uid(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl Pid {
    /// Process id the kernel itself uses when it originates a request.
    pub const KERNEL: Pid = Pid(0);
}
