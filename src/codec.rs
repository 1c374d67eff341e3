//! Canonical byte encoding.
//!
//! Everything that is hashed, signed or put on the wire goes through the
//! same serializer, so the bytes two peers compute for the same value are
//! identical by construction. The format is flat: integers big-endian and
//! fixed width, byte newtypes raw, strings and vectors prefixed with a
//! 32-bit big-endian count.
//!
//! Decoding is explicit per type (see [`Decoder`]); the serde data model is
//! only used for the encode direction, where it gives us derived canonical
//! encodings for free.

mod ser;

pub use ser::{to_writer, EncodeError, Writer};

use serde::Serialize;
use sha3::{Digest, Keccak256, Sha3_256};

use crate::types::{Address, Hash, Signature, U256};

impl Writer for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

struct Keccak256Writer {
    hasher: Keccak256,
}

impl Writer for Keccak256Writer {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

struct Sha3Writer {
    hasher: Sha3_256,
}

impl Writer for Sha3Writer {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

/// Canonical encoding of `value` as a byte vector.
pub fn to_bytes<T>(value: &T) -> Result<Vec<u8>, EncodeError>
where
    T: Serialize,
{
    let mut buf = Vec::new();
    to_writer(value, &mut buf)?;
    Ok(buf)
}

/// Keccak256 over the canonical encoding. Used for channel ids and state
/// hashes, which must match what the adjudicator contract computes.
pub fn to_hash<T>(value: &T) -> Result<Hash, EncodeError>
where
    T: Serialize,
{
    let mut writer = Keccak256Writer {
        hasher: Keccak256::new(),
    };
    to_writer(value, &mut writer)?;
    Ok(Hash(writer.hasher.finalize().into()))
}

/// Sha3-256 over the canonical encoding. Session ids use this instead of
/// Keccak256 so they cannot collide with anything the contracts hash.
pub fn to_sha3_hash<T>(value: &T) -> Result<Hash, EncodeError>
where
    T: Serialize,
{
    let mut writer = Sha3Writer {
        hasher: Sha3_256::new(),
    };
    to_writer(value, &mut writer)?;
    Ok(Hash(writer.hasher.finalize().into()))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("length {len} exceeds limit {limit}")]
    LengthOutOfRange { len: usize, limit: usize },
}

/// Checked reader over a canonical encoding.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DecodeError::InvalidBool(b)),
        }
    }

    pub fn u256(&mut self) -> Result<U256, DecodeError> {
        Ok(U256::from_big_endian(self.take(32)?))
    }

    pub fn address(&mut self) -> Result<Address, DecodeError> {
        Ok(Address(self.array()?))
    }

    pub fn hash(&mut self) -> Result<Hash, DecodeError> {
        Ok(Hash(self.array()?))
    }

    pub fn signature(&mut self) -> Result<Signature, DecodeError> {
        Ok(Signature(self.array()?))
    }

    /// Reads a 32-bit count prefix, bounded by `limit`.
    pub fn seq_len(&mut self, limit: usize) -> Result<usize, DecodeError> {
        let len = self.u32()? as usize;
        if len > limit {
            return Err(DecodeError::LengthOutOfRange { len, limit });
        }
        Ok(len)
    }

    pub fn bytes(&mut self, limit: usize) -> Result<Vec<u8>, DecodeError> {
        let len = self.seq_len(limit)?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn string(&mut self, limit: usize) -> Result<String, DecodeError> {
        let raw = self.bytes(limit)?;
        String::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Asserts the whole input was consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buf.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Sample {
        version: u64,
        tag: u16,
        flag: bool,
        data: Vec<u8>,
        label: String,
    }

    #[test]
    fn flat_layout() {
        let v = Sample {
            version: 7,
            tag: 0x0102,
            flag: true,
            data: vec![0xaa, 0xbb],
            label: "hi".into(),
        };
        let bytes = to_bytes(&v).unwrap();
        let mut expected = vec![0, 0, 0, 0, 0, 0, 0, 7]; // version
        expected.extend([0x01, 0x02]); // tag
        expected.push(1); // flag
        expected.extend([0, 0, 0, 2, 0xaa, 0xbb]); // data
        expected.extend([0, 0, 0, 2, b'h', b'i']); // label
        assert_eq!(bytes, expected);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.u64().unwrap(), 7);
        assert_eq!(dec.u16().unwrap(), 0x0102);
        assert!(dec.bool().unwrap());
        assert_eq!(dec.bytes(16).unwrap(), vec![0xaa, 0xbb]);
        assert_eq!(dec.string(16).unwrap(), "hi");
        dec.finish().unwrap();
    }

    #[test]
    fn hashing_is_stable() {
        let v = Sample {
            version: 1,
            tag: 2,
            flag: false,
            data: vec![],
            label: String::new(),
        };
        assert_eq!(to_hash(&v).unwrap(), to_hash(&v).unwrap());
        assert_ne!(to_hash(&v).unwrap(), to_sha3_hash(&v).unwrap());
    }

    #[test]
    fn decoder_rejects_short_input() {
        let mut dec = Decoder::new(&[0, 0]);
        assert_eq!(dec.u32(), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn decoder_rejects_oversized_length() {
        let mut dec = Decoder::new(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            dec.bytes(256),
            Err(DecodeError::LengthOutOfRange { .. })
        ));
    }

    #[test]
    fn decoder_rejects_trailing_bytes() {
        let dec = Decoder::new(&[1]);
        assert_eq!(dec.finish(), Err(DecodeError::TrailingBytes(1)));
    }
}
