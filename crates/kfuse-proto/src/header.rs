use bytes::{BufMut, Bytes, BytesMut};
use kfuse_types::{Gid, NodeId, Pid, RequestId, Uid};

use crate::opcode::Opcode;
use crate::wire::{WireDecode, WireEncode, WireError};

pub const IN_HEADER_SIZE: usize = 40;
pub const OUT_HEADER_SIZE: usize = 16;

/// Upper bound on a single frame in either direction (header included).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024 + IN_HEADER_SIZE;

/// Most negative status a reply may carry.
const MIN_REPLY_ERROR: i32 = -1000;

wire_struct! {
    /// Header prepended to every request written to the daemon.
    pub struct InHeader {
        pub len: u32,
        pub opcode: u32,
        pub unique: u64,
        pub nodeid: u64,
        pub uid: u32,
        pub gid: u32,
        pub pid: u32,
        pub padding: u32,
    }
}

wire_struct! {
    /// Header prepended to every reply. `error` is zero or a negated errno.
    pub struct OutHeader {
        pub len: u32,
        pub error: i32,
        pub unique: u64,
    }
}

impl InHeader {
    pub fn new(opcode: Opcode, unique: RequestId, node: NodeId, uid: Uid, gid: Gid, pid: Pid) -> Self {
        Self {
            len: 0,
            opcode: opcode.code(),
            unique: unique.get(),
            nodeid: node.get(),
            uid: uid.get(),
            gid: gid.get(),
            pid: pid.get(),
            padding: 0,
        }
    }

    pub fn opcode(&self) -> Result<Opcode, WireError> {
        Opcode::try_from(self.opcode).map_err(|_| WireError::InvalidValue {
            field: "opcode",
            value: u64::from(self.opcode),
        })
    }

    pub fn unique(&self) -> RequestId {
        RequestId::from(self.unique)
    }

    pub fn node(&self) -> NodeId {
        NodeId::from(self.nodeid)
    }

    /// Build a complete request frame, filling in `len`.
    pub fn frame(mut self, payload: &[u8]) -> Bytes {
        let total = IN_HEADER_SIZE + payload.len();
        self.len = total as u32;
        let mut buf = Vec::with_capacity(total);
        self.wire_encode(&mut buf);
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }
}

impl OutHeader {
    /// Build a complete reply frame; `errno` is positive (or zero).
    pub fn frame(unique: RequestId, errno: i32, payload: &[u8]) -> Bytes {
        let total = OUT_HEADER_SIZE + payload.len();
        let header = OutHeader {
            len: total as u32,
            error: -errno,
            unique: unique.get(),
        };
        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(&header.to_wire());
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn unique(&self) -> RequestId {
        RequestId::from(self.unique)
    }

    /// Positive errno reported by the daemon, zero on success.
    pub fn errno(&self) -> i32 {
        -self.error
    }
}

fn check_frame_len(declared: usize, actual: usize, min: usize) -> Result<(), WireError> {
    if actual > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: actual });
    }
    if declared != actual || declared < min {
        return Err(WireError::LengthMismatch { declared, actual });
    }
    Ok(())
}

/// Split a request frame into header and payload.
pub fn decode_request(frame: &Bytes) -> Result<(InHeader, Bytes), WireError> {
    let header = InHeader::from_wire(frame)?;
    check_frame_len(header.len as usize, frame.len(), IN_HEADER_SIZE)?;
    header.opcode()?;
    Ok((header, frame.slice(IN_HEADER_SIZE..)))
}

/// Split a reply frame into header and payload.
pub fn decode_reply(frame: &Bytes) -> Result<(OutHeader, Bytes), WireError> {
    let header = OutHeader::from_wire(frame)?;
    check_frame_len(header.len as usize, frame.len(), OUT_HEADER_SIZE)?;
    if header.error > 0 || header.error < MIN_REPLY_ERROR {
        return Err(WireError::InvalidValue {
            field: "error",
            value: header.error as u64,
        });
    }
    Ok((header, frame.slice(OUT_HEADER_SIZE..)))
}
