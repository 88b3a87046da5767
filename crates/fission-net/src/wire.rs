//! Wire encoding for the mesh protocol.
//!
//! All multi-byte fields are little-endian. A datagram carries exactly
//! one packet, so the decoding entry point for received traffic is
//! [`Decode::decode_datagram`], which treats leftover bytes as an
//! error.

pub mod packet;

pub use packet::{AckBits, AckHeader, DataHeader, Packet, PacketType, MAGIC};

use std::string::FromUtf8Error;

use bytes::{Buf, BufMut};

/// Why a datagram was rejected.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("datagram does not start with the mesh magic (got {actual:02x?})")]
    Magic { actual: [u8; 4] },
    #[error("unknown packet type {actual}")]
    PacketType { actual: u8 },
    #[error("peer name is not valid UTF-8: {0}")]
    Name(#[from] FromUtf8Error),
    #[error("datagram truncated: needed {requested} more bytes, had {available}")]
    Truncated { available: usize, requested: usize },
    #[error("{left} bytes left over after the packet")]
    Trailing { left: usize },
}

impl From<bytes::TryGetError> for Error {
    fn from(
        bytes::TryGetError {
            available,
            requested,
        }: bytes::TryGetError,
    ) -> Self {
        Self::Truncated {
            available,
            requested,
        }
    }
}

/// Things that write themselves to a datagram buffer.
pub trait Encode {
    fn encode(&self, buf: &mut impl BufMut);

    /// Encode into a freshly allocated buffer.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.encode(&mut buf);
        buf
    }
}

/// Things that read themselves from a datagram buffer.
pub trait Decode: Sized {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error>;

    /// Decode a whole datagram. Since a datagram carries exactly one
    /// packet, trailing bytes mean the datagram isn't ours and are
    /// rejected rather than ignored.
    fn decode_datagram(mut data: &[u8]) -> Result<Self, Error> {
        let value = Self::decode(&mut data)?;
        if !data.is_empty() {
            return Err(Error::Trailing { left: data.len() });
        }
        Ok(value)
    }
}

impl Encode for u8 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(*self);
    }
}

impl Encode for u16 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(*self);
    }
}

impl Encode for u32 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(*self);
    }
}

impl Encode for u64 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(*self);
    }
}

impl Encode for u128 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u128_le(*self);
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self);
    }
}

impl Decode for u8 {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(buf.try_get_u8()?)
    }
}

impl Decode for u16 {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(buf.try_get_u16_le()?)
    }
}

impl Decode for u32 {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(buf.try_get_u32_le()?)
    }
}

impl Decode for u64 {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(buf.try_get_u64_le()?)
    }
}

impl Decode for u128 {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(buf.try_get_u128_le()?)
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        let mut ary = [0; N];
        buf.try_copy_to_slice(&mut ary)?;

        Ok(ary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fmt::Debug;

    use qcheck_macros::quickcheck;

    fn roundtrip<T>(value: T)
    where
        T: Encode + Decode + PartialEq + Debug,
    {
        assert_eq!(
            T::decode_datagram(&value.encode_to_vec()).expect("roundtrip"),
            value
        );
    }

    #[quickcheck]
    fn prop_integers_roundtrip(a: u16, b: u32, c: u64, d: u128) {
        roundtrip(a);
        roundtrip(b);
        roundtrip(c);
        roundtrip(d);
    }

    #[test]
    fn test_little_endian() {
        assert_eq!(0x0102u16.encode_to_vec(), vec![0x02, 0x01]);
        assert_eq!(0x01020304u32.encode_to_vec(), vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(
            0x0102030405060708u64.encode_to_vec(),
            vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_truncated_and_trailing() {
        assert!(matches!(
            u32::decode_datagram(&[1, 2]),
            Err(Error::Truncated {
                available: 2,
                requested: 4
            })
        ));
        assert!(matches!(
            u16::decode_datagram(&[1, 2, 3]),
            Err(Error::Trailing { left: 1 })
        ));
    }
}
