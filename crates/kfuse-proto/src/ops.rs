//! Payloads for the requests the dispatch core issues itself.

use kfuse_types::{FileHandleId, NodeId, RequestId, Timespec};

/// Daemon asks for page-cache bypass on this open.
pub const FOPEN_DIRECT_IO: u32 = 1 << 0;
/// Daemon asks to keep cached content across opens.
pub const FOPEN_KEEP_CACHE: u32 = 1 << 1;

/// Request bit asking the daemon to open the link itself, not its target.
pub const O_SYMLINK: u32 = 0x0020_0000;

wire_struct! {
    pub struct OpenIn {
        pub flags: u32,
        pub unused: u32,
    }
}

wire_struct! {
    pub struct OpenOut {
        pub fh: u64,
        pub open_flags: u32,
        pub padding: u32,
    }
}

wire_struct! {
    pub struct ReleaseIn {
        pub fh: u64,
        pub flags: u32,
        pub release_flags: u32,
        pub lock_owner: u64,
    }
}

wire_struct! {
    pub struct ForgetIn {
        pub nlookup: u64,
    }
}

wire_struct! {
    pub struct InterruptIn {
        pub unique: u64,
    }
}

wire_struct! {
    pub struct GetattrIn {
        pub getattr_flags: u32,
        pub dummy: u32,
        pub fh: u64,
    }
}

wire_struct! {
    /// Node attributes as reported by the daemon. A negative `crtime`
    /// means the daemon did not supply a creation time.
    pub struct Attr {
        pub ino: u64,
        pub size: u64,
        pub blocks: u64,
        pub atime: i64,
        pub mtime: i64,
        pub ctime: i64,
        pub crtime: i64,
        pub atimensec: u32,
        pub mtimensec: u32,
        pub ctimensec: u32,
        pub crtimensec: u32,
        pub mode: u32,
        pub nlink: u32,
        pub uid: u32,
        pub gid: u32,
        pub rdev: u32,
        pub flags: u32,
        pub blksize: u32,
        pub padding: u32,
    }
}

wire_struct! {
    pub struct AttrOut {
        pub attr_valid: u64,
        pub attr_valid_nsec: u32,
        pub dummy: u32,
        pub attr: Attr,
    }
}

wire_struct! {
    pub struct EntryOut {
        pub nodeid: u64,
        pub generation: u64,
        pub entry_valid: u64,
        pub attr_valid: u64,
        pub entry_valid_nsec: u32,
        pub attr_valid_nsec: u32,
        pub attr: Attr,
    }
}

wire_struct! {
    pub struct XtimesOut {
        pub bkuptime: u64,
        pub crtime: u64,
        pub bkuptimensec: u32,
        pub crtimensec: u32,
    }
}

fn ttl(sec: u64, nsec: u32) -> Timespec {
    Timespec::new(i64::try_from(sec).unwrap_or(i64::MAX), nsec)
}

impl OpenIn {
    pub fn new(flags: u32) -> Self {
        Self { flags, unused: 0 }
    }
}

impl OpenOut {
    pub fn handle(&self) -> FileHandleId {
        FileHandleId::from(self.fh)
    }

    pub fn direct_io(&self) -> bool {
        self.open_flags & FOPEN_DIRECT_IO != 0
    }
}

impl ReleaseIn {
    pub fn new(fh: FileHandleId, flags: u32) -> Self {
        Self {
            fh: fh.get(),
            flags,
            release_flags: 0,
            lock_owner: 0,
        }
    }
}

impl InterruptIn {
    pub fn new(unique: RequestId) -> Self {
        Self {
            unique: unique.get(),
        }
    }
}

impl Attr {
    pub fn atime(&self) -> Timespec {
        Timespec::new(self.atime, self.atimensec)
    }

    pub fn mtime(&self) -> Timespec {
        Timespec::new(self.mtime, self.mtimensec)
    }

    pub fn ctime(&self) -> Timespec {
        Timespec::new(self.ctime, self.ctimensec)
    }

    pub fn crtime(&self) -> Option<Timespec> {
        (self.crtime >= 0).then(|| Timespec::new(self.crtime, self.crtimensec))
    }
}

impl AttrOut {
    pub fn ttl(&self) -> Timespec {
        ttl(self.attr_valid, self.attr_valid_nsec)
    }
}

impl EntryOut {
    pub fn node(&self) -> NodeId {
        NodeId::from(self.nodeid)
    }

    pub fn attr_ttl(&self) -> Timespec {
        ttl(self.attr_valid, self.attr_valid_nsec)
    }

    pub fn entry_ttl(&self) -> Timespec {
        ttl(self.entry_valid, self.entry_valid_nsec)
    }
}

impl XtimesOut {
    pub fn crtime(&self) -> Timespec {
        ttl(self.crtime, self.crtimensec)
    }

    pub fn bkuptime(&self) -> Timespec {
        ttl(self.bkuptime, self.bkuptimensec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{WireDecode, WireEncode, WireError};

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(OpenIn::WIRE_SIZE, 8);
        assert_eq!(OpenOut::WIRE_SIZE, 16);
        assert_eq!(ReleaseIn::WIRE_SIZE, 24);
        assert_eq!(Attr::WIRE_SIZE, 104);
        assert_eq!(AttrOut::WIRE_SIZE, 120);
        assert_eq!(EntryOut::WIRE_SIZE, 144);
        assert_eq!(XtimesOut::WIRE_SIZE, 24);
    }

    #[test]
    fn test_entry_out_decodes_nested_attr() {
        let entry = EntryOut {
            nodeid: 17,
            attr_valid: 2,
            attr_valid_nsec: 500,
            attr: Attr {
                ino: 17,
                size: 4096,
                mode: 0o100644,
                crtime: -1,
                ..Default::default()
            },
            ..Default::default()
        };
        let decoded = EntryOut::from_wire(&entry.to_wire()).unwrap();
        assert_eq!(decoded.node(), NodeId::from(17));
        assert_eq!(decoded.attr.size, 4096);
        assert_eq!(decoded.attr_ttl(), Timespec::new(2, 500));
        assert_eq!(decoded.attr.crtime(), None);
    }

    #[test]
    fn test_truncated_open_out() {
        let buf = OpenOut::default().to_wire();
        let err = OpenOut::from_wire(&buf[..10]).unwrap_err();
        assert!(matches!(err, WireError::InsufficientData { need: 4, .. }));
    }

    #[test]
    fn test_open_out_direct_io() {
        let out = OpenOut {
            fh: 3,
            open_flags: FOPEN_DIRECT_IO,
            padding: 0,
        };
        assert!(out.direct_io());
        assert_eq!(out.handle(), FileHandleId::from(3));
    }
}
