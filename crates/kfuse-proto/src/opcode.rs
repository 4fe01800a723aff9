use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Request opcodes understood by the daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    Getattr = 3,
    Setattr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Setxattr = 21,
    Getxattr = 22,
    Listxattr = 23,
    Removexattr = 24,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
    Getlk = 31,
    Setlk = 32,
    Setlkw = 33,
    Access = 34,
    Create = 35,
    Interrupt = 36,
    Bmap = 37,
    Destroy = 38,
    Setvolname = 61,
    Getxtimes = 62,
    Exchange = 63,
}

impl Opcode {
    pub fn code(self) -> u32 {
        self.into()
    }

    /// Opcodes every conforming daemon must implement. An ENOSYS reply to
    /// one of these kills the session.
    pub fn is_mandatory(self) -> bool {
        self.code() <= Opcode::Release.code()
            || matches!(
                self,
                Opcode::Init | Opcode::Opendir | Opcode::Readdir | Opcode::Releasedir
            )
    }

    /// Bit recorded in the session's not-implemented set, `None` for
    /// mandatory opcodes.
    pub fn capability_bit(self) -> Option<u64> {
        if self.is_mandatory() {
            None
        } else {
            Some(1u64 << self.code())
        }
    }

    /// Opcodes sent without waiting for a reply.
    pub fn is_noreply(self) -> bool {
        matches!(self, Opcode::Forget | Opcode::Interrupt)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
