//! Bit-exact consensus encoding: little-endian integers, compact-size
//! lengths, and length-prefixed byte strings.
//!
//! Decoding is bounds-checked and never panics on attacker-controlled
//! input; malformed bytes surface as `ProtocolError`.

use std::io::{self, Read, Write};
use thiserror::Error;

use super::hash::Sha256dHash;

/// Hard cap on any single decoded message payload.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Cap applied to decoded collection counts before allocation. A peer can
/// claim any length in a compact-size prefix; we grow incrementally and
/// refuse counts that could not fit in a legal payload.
pub const MAX_VEC_PREALLOC: usize = 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("non-minimal compact-size encoding")]
    NonMinimalVarInt,

    #[error("length {0} exceeds maximum allowed")]
    OversizedLength(u64),

    #[error("bad network magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("payload checksum mismatch")]
    BadChecksum,

    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

impl ProtocolError {
    /// True when the error means "stream ended", as opposed to bytes that
    /// decoded into garbage.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Consensus encoding to a writer. Returns the number of bytes written.
pub trait Encodable {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError>;

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.encode(&mut v)
            .expect("in-memory encode cannot fail");
        v
    }
}

/// Consensus decoding from a reader.
pub trait Decodable: Sized {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError>;

    fn decode_all(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = io::Cursor::new(bytes);
        let value = Self::decode(&mut cursor)?;
        if cursor.position() as usize != bytes.len() {
            return Err(ProtocolError::Malformed("trailing bytes after message"));
        }
        Ok(value)
    }
}

macro_rules! int_codec {
    ($ty:ty, $len:expr) => {
        impl Encodable for $ty {
            fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
                w.write_all(&self.to_le_bytes())?;
                Ok($len)
            }
        }

        impl Decodable for $ty {
            fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
                let mut buf = [0u8; $len];
                r.read_exact(&mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }
        }
    };
}

int_codec!(u8, 1);
int_codec!(u16, 2);
int_codec!(u32, 4);
int_codec!(u64, 8);
int_codec!(i32, 4);
int_codec!(i64, 8);

impl Encodable for Sha256dHash {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        w.write_all(self.as_bytes())?;
        Ok(32)
    }
}

impl Decodable for Sha256dHash {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let mut buf = [0u8; 32];
        r.read_exact(&mut buf)?;
        Ok(Sha256dHash::from_bytes(buf))
    }
}

/// Compact-size length prefix: 1, 3, 5, or 9 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInt(pub u64);

impl VarInt {
    pub fn encoded_len(&self) -> usize {
        match self.0 {
            0..=0xFC => 1,
            0xFD..=0xFFFF => 3,
            0x1_0000..=0xFFFF_FFFF => 5,
            _ => 9,
        }
    }
}

impl Encodable for VarInt {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        match self.0 {
            n @ 0..=0xFC => {
                (n as u8).encode(w)?;
                Ok(1)
            }
            n @ 0xFD..=0xFFFF => {
                0xFDu8.encode(w)?;
                (n as u16).encode(w)?;
                Ok(3)
            }
            n @ 0x1_0000..=0xFFFF_FFFF => {
                0xFEu8.encode(w)?;
                (n as u32).encode(w)?;
                Ok(5)
            }
            n => {
                0xFFu8.encode(w)?;
                n.encode(w)?;
                Ok(9)
            }
        }
    }
}

impl Decodable for VarInt {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let tag = u8::decode(r)?;
        let value = match tag {
            0xFF => {
                let n = u64::decode(r)?;
                if n < 0x1_0000_0000 {
                    return Err(ProtocolError::NonMinimalVarInt);
                }
                n
            }
            0xFE => {
                let n = u32::decode(r)? as u64;
                if n < 0x1_0000 {
                    return Err(ProtocolError::NonMinimalVarInt);
                }
                n
            }
            0xFD => {
                let n = u16::decode(r)? as u64;
                if n < 0xFD {
                    return Err(ProtocolError::NonMinimalVarInt);
                }
                n
            }
            n => n as u64,
        };
        Ok(VarInt(value))
    }
}

/// Length-prefixed byte string (scripts, signatures, user agents).
pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<usize, ProtocolError> {
    let mut n = VarInt(bytes.len() as u64).encode(w)?;
    w.write_all(bytes)?;
    n += bytes.len();
    Ok(n)
}

pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let len = VarInt::decode(r)?.0;
    if len as usize > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::OversizedLength(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Variable-length ASCII string (e.g. the version user agent).
pub fn write_string<W: Write>(w: &mut W, s: &str) -> Result<usize, ProtocolError> {
    write_bytes(w, s.as_bytes())
}

pub fn read_string<R: Read>(r: &mut R) -> Result<String, ProtocolError> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::Malformed("non-utf8 string"))
}

/// Compact-size-prefixed list of encodable items.
pub fn write_list<W: Write, T: Encodable>(w: &mut W, items: &[T]) -> Result<usize, ProtocolError> {
    let mut n = VarInt(items.len() as u64).encode(w)?;
    for item in items {
        n += item.encode(w)?;
    }
    Ok(n)
}

pub fn read_list<R: Read, T: Decodable>(r: &mut R, max: usize) -> Result<Vec<T>, ProtocolError> {
    let count = VarInt::decode(r)?.0;
    if count as usize > max {
        return Err(ProtocolError::OversizedLength(count));
    }
    let mut items = Vec::with_capacity((count as usize).min(MAX_VEC_PREALLOC));
    for _ in 0..count {
        items.push(T::decode(r)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(0xFC, 1)]
    #[case(0xFD, 3)]
    #[case(0xFFFF, 3)]
    #[case(0x1_0000, 5)]
    #[case(0xFFFF_FFFF, 5)]
    #[case(0x1_0000_0000, 9)]
    fn varint_width(#[case] value: u64, #[case] width: usize) {
        let v = VarInt(value);
        assert_eq!(v.encoded_len(), width);
        let bytes = v.encode_to_vec();
        assert_eq!(bytes.len(), width);
        assert_eq!(VarInt::decode_all(&bytes).unwrap(), v);
    }

    #[test]
    fn varint_rejects_non_minimal() {
        // 0x05 padded out to the 3-byte form.
        let bytes = [0xFDu8, 0x05, 0x00];
        assert!(matches!(
            VarInt::decode_all(&bytes),
            Err(ProtocolError::NonMinimalVarInt)
        ));
    }

    #[test]
    fn ints_are_little_endian() {
        assert_eq!(0xDEAD_BEEFu32.encode_to_vec(), vec![0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(u32::decode_all(&[0xEF, 0xBE, 0xAD, 0xDE]).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn short_input_is_eof_not_panic() {
        let err = u64::decode_all(&[0x01, 0x02]).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let err = u8::decode_all(&[0x01, 0x02]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
