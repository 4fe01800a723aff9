use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("insufficient data: need {need} bytes but only {have} remain")]
    InsufficientData { need: usize, have: usize },
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: u64 },
    #[error("frame length {declared} disagrees with {actual} bytes received")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame too large: {size} bytes")]
    FrameTooLarge { size: usize },
}

/// Fixed-layout types that append themselves to an outgoing buffer.
pub trait WireEncode {
    /// Encoded size in bytes.
    const WIRE_SIZE: usize;

    fn wire_encode(&self, buf: &mut Vec<u8>);

    fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        self.wire_encode(&mut buf);
        buf
    }
}

pub trait WireDecode: Sized {
    fn wire_decode(buf: &[u8], offset: &mut usize) -> Result<Self, WireError>;

    /// Decode from the start of `buf`, ignoring trailing bytes.
    fn from_wire(buf: &[u8]) -> Result<Self, WireError> {
        let mut offset = 0;
        Self::wire_decode(buf, &mut offset)
    }
}

pub(crate) fn read_bytes<'a>(
    buf: &'a [u8],
    offset: &mut usize,
    n: usize,
) -> Result<&'a [u8], WireError> {
    let have = buf.len().saturating_sub(*offset);
    if have < n {
        return Err(WireError::InsufficientData { need: n, have });
    }
    let slice = &buf[*offset..*offset + n];
    *offset += n;
    Ok(slice)
}

macro_rules! impl_wire_for_int {
    ($ty:ty, $size:expr, $read:ident, $write:ident) => {
        impl WireEncode for $ty {
            const WIRE_SIZE: usize = $size;

            fn wire_encode(&self, buf: &mut Vec<u8>) {
                let mut tmp = [0u8; $size];
                LittleEndian::$write(&mut tmp, *self);
                buf.extend_from_slice(&tmp);
            }
        }

        impl WireDecode for $ty {
            fn wire_decode(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
                let bytes = read_bytes(buf, offset, $size)?;
                Ok(LittleEndian::$read(bytes))
            }
        }
    };
}

impl_wire_for_int!(u32, 4, read_u32, write_u32);
impl_wire_for_int!(u64, 8, read_u64, write_u64);
impl_wire_for_int!(i32, 4, read_i32, write_i32);
impl_wire_for_int!(i64, 8, read_i64, write_i64);
