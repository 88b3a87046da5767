//! Mesh protocol packets.
//!
//! Every datagram starts with the 4-byte magic followed by a 1-byte
//! packet type. Type-specific fields follow.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      0xE2     |      0x98     |      0xA2     |      0x02     | Magic
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Type     |      Fields                                ...| Type-specific fields (variable size)
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut};

use crate::wire;
use crate::wire::{Decode, Encode};

/// Bytes every mesh datagram starts with.
pub const MAGIC: [u8; 4] = [0xE2, 0x98, 0xA2, 0x02];

/// Packet type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// A peer announcing itself, either to the multicast group or
    /// directed at a single address.
    Announce = 1,
    /// A peer leaving the network.
    Leave = 2,
    /// A payload fragment.
    Data = 3,
    /// Acknowledgement of received fragments.
    Ack = 4,
    /// Request for retransmission of fragments.
    Nack = 5,
}

impl From<PacketType> for u8 {
    fn from(other: PacketType) -> Self {
        other as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(other: u8) -> Result<Self, Self::Error> {
        match other {
            1 => Ok(PacketType::Announce),
            2 => Ok(PacketType::Leave),
            3 => Ok(PacketType::Data),
            4 => Ok(PacketType::Ack),
            5 => Ok(PacketType::Nack),
            _ => Err(other),
        }
    }
}

/// Header of a [`PacketType::Data`] fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Identifies the payload all fragments of this transmission belong to.
    pub packet_id: u32,
    /// Index of this fragment, `0..packet_count`.
    pub packet_no: u16,
    /// Total number of fragments in the transmission.
    pub packet_count: u16,
    /// Whether the sender expects acknowledgements.
    pub reliable: bool,
    /// Stable hash identifying the transported payload type.
    pub hash: u128,
}

impl DataHeader {
    /// On-the-wire size of a data header, including magic and type.
    pub const SIZE: usize = 4 + 1 + 4 + 2 + 2 + 1 + 16;

    /// Build the full datagram for one fragment.
    pub fn frame(&self, chunk: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + chunk.len());
        MAGIC.encode(&mut buf);
        u8::from(PacketType::Data).encode(&mut buf);
        self.encode(&mut buf);
        buf.put_slice(chunk);
        buf
    }
}

impl Encode for DataHeader {
    fn encode(&self, buf: &mut impl BufMut) {
        self.packet_id.encode(buf);
        self.packet_no.encode(buf);
        self.packet_count.encode(buf);
        u8::from(self.reliable).encode(buf);
        self.hash.encode(buf);
    }
}

impl Decode for DataHeader {
    fn decode(buf: &mut impl Buf) -> Result<Self, wire::Error> {
        let packet_id = u32::decode(buf)?;
        let packet_no = u16::decode(buf)?;
        let packet_count = u16::decode(buf)?;
        let reliable = u8::decode(buf)? != 0;
        let hash = u128::decode(buf)?;

        Ok(Self {
            packet_id,
            packet_no,
            packet_count,
            reliable,
            hash,
        })
    }
}

/// Fragment bitset carried by [`PacketType::Ack`] and [`PacketType::Nack`]
/// packets. One bit per fragment, `packet_count` bits rounded up to whole
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBits(Vec<u8>);

impl AckBits {
    /// Number of bytes needed to carry one bit per fragment.
    ///
    /// Nb. This must be a ceiling division: truncating loses the final
    /// partial byte whenever `packet_count` is not a multiple of eight.
    pub fn size(packet_count: u16) -> usize {
        (packet_count as usize).div_ceil(8)
    }

    /// An all-zero bitset sized for `packet_count` fragments.
    pub fn empty(packet_count: u16) -> Self {
        Self(vec![0; Self::size(packet_count)])
    }

    pub fn set(&mut self, no: u16) {
        self.0[no as usize / 8] |= 1 << (no % 8);
    }

    pub fn unset(&mut self, no: u16) {
        self.0[no as usize / 8] &= !(1 << (no % 8));
    }

    pub fn contains(&self, no: u16) -> bool {
        match self.0.get(no as usize / 8) {
            Some(byte) => byte & (1 << (no % 8)) != 0,
            None => false,
        }
    }

    /// Merge acknowledged fragments from `other`.
    pub fn union(&mut self, other: &AckBits) {
        for (byte, o) in self.0.iter_mut().zip(other.0.iter()) {
            *byte |= o;
        }
    }

    /// Remove fragments set in `other`.
    pub fn difference(&mut self, other: &AckBits) {
        for (byte, o) in self.0.iter_mut().zip(other.0.iter()) {
            *byte &= !o;
        }
    }

    /// Whether all `packet_count` fragments are set.
    pub fn complete(&self, packet_count: u16) -> bool {
        (0..packet_count).all(|no| self.contains(no))
    }

    /// Fragment indices that are set.
    pub fn ones(&self, packet_count: u16) -> impl Iterator<Item = u16> + '_ {
        (0..packet_count).filter(|no| self.contains(*no))
    }

    /// Fragment indices that are clear.
    pub fn zeroes(&self, packet_count: u16) -> impl Iterator<Item = u16> + '_ {
        (0..packet_count).filter(|no| !self.contains(*no))
    }
}

/// Header of an [`PacketType::Ack`] or [`PacketType::Nack`] packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHeader {
    /// The transmission being acknowledged.
    pub packet_id: u32,
    /// The fragment that triggered this acknowledgement.
    pub packet_no: u16,
    /// Total fragment count of the transmission.
    pub packet_count: u16,
    /// For an ACK, fragments the sender has received; for a NACK,
    /// fragments the sender wants retransmitted.
    pub bits: AckBits,
}

impl Encode for AckHeader {
    fn encode(&self, buf: &mut impl BufMut) {
        self.packet_id.encode(buf);
        self.packet_no.encode(buf);
        self.packet_count.encode(buf);
        buf.put_slice(&self.bits.0);
    }
}

impl Decode for AckHeader {
    fn decode(buf: &mut impl Buf) -> Result<Self, wire::Error> {
        let packet_id = u32::decode(buf)?;
        let packet_no = u16::decode(buf)?;
        let packet_count = u16::decode(buf)?;

        let mut bits = vec![0; AckBits::size(packet_count)];
        buf.try_copy_to_slice(&mut bits)?;

        Ok(Self {
            packet_id,
            packet_no,
            packet_count,
            bits: AckBits(bits),
        })
    }
}

/// A decoded mesh datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Peer announcement carrying the peer's name.
    Announce { name: String },
    /// Peer departure.
    Leave,
    /// One payload fragment.
    Data {
        header: DataHeader,
        payload: Vec<u8>,
    },
    /// Fragment acknowledgement.
    Ack(AckHeader),
    /// Retransmission request.
    Nack(AckHeader),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Announce { .. } => PacketType::Announce,
            Self::Leave => PacketType::Leave,
            Self::Data { .. } => PacketType::Data,
            Self::Ack(_) => PacketType::Ack,
            Self::Nack(_) => PacketType::Nack,
        }
    }
}

impl Encode for Packet {
    fn encode(&self, buf: &mut impl BufMut) {
        MAGIC.encode(buf);
        u8::from(self.packet_type()).encode(buf);

        match self {
            Self::Announce { name } => buf.put_slice(name.as_bytes()),
            Self::Leave => {}
            Self::Data { header, payload } => {
                header.encode(buf);
                buf.put_slice(payload);
            }
            Self::Ack(ack) => ack.encode(buf),
            Self::Nack(nack) => nack.encode(buf),
        }
    }
}

impl Decode for Packet {
    fn decode(buf: &mut impl Buf) -> Result<Self, wire::Error> {
        let magic: [u8; 4] = Decode::decode(buf)?;
        if magic != MAGIC {
            return Err(wire::Error::Magic { actual: magic });
        }

        match PacketType::try_from(u8::decode(buf)?) {
            Ok(PacketType::Announce) => {
                let mut name = vec![0; buf.remaining()];
                buf.copy_to_slice(&mut name);
                let name = String::from_utf8(name).map_err(wire::Error::from)?;

                Ok(Self::Announce { name })
            }
            Ok(PacketType::Leave) => Ok(Self::Leave),
            Ok(PacketType::Data) => {
                let header = DataHeader::decode(buf)?;
                let mut payload = vec![0; buf.remaining()];
                buf.copy_to_slice(&mut payload);

                Ok(Self::Data { header, payload })
            }
            Ok(PacketType::Ack) => Ok(Self::Ack(AckHeader::decode(buf)?)),
            Ok(PacketType::Nack) => Ok(Self::Nack(AckHeader::decode(buf)?)),
            Err(other) => Err(wire::Error::PacketType { actual: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use qcheck::{Arbitrary, Gen};
    use qcheck_macros::quickcheck;

    /// Every packet survives the datagram boundary unchanged.
    fn roundtrip(packet: Packet) {
        let datagram = packet.encode_to_vec();
        assert_eq!(
            Packet::decode_datagram(&datagram).expect("roundtrip"),
            packet
        );
    }

    impl Arbitrary for DataHeader {
        fn arbitrary(g: &mut Gen) -> Self {
            Self {
                packet_id: u32::arbitrary(g),
                packet_no: u16::arbitrary(g),
                packet_count: u16::arbitrary(g),
                reliable: bool::arbitrary(g),
                hash: u128::arbitrary(g),
            }
        }
    }

    impl Arbitrary for AckHeader {
        fn arbitrary(g: &mut Gen) -> Self {
            let packet_count = u16::arbitrary(g) % 512;
            let mut bits = AckBits::empty(packet_count);

            for no in 0..packet_count {
                if bool::arbitrary(g) {
                    bits.set(no);
                }
            }
            Self {
                packet_id: u32::arbitrary(g),
                packet_no: u16::arbitrary(g),
                packet_count,
                bits,
            }
        }
    }

    #[quickcheck]
    fn prop_roundtrip_data(header: DataHeader, payload: Vec<u8>) {
        roundtrip(Packet::Data { header, payload });
    }

    #[quickcheck]
    fn prop_roundtrip_ack(ack: AckHeader) {
        roundtrip(Packet::Ack(ack.clone()));
        roundtrip(Packet::Nack(ack));
    }

    #[quickcheck]
    fn prop_roundtrip_announce(name: String) {
        roundtrip(Packet::Announce { name });
    }

    #[test]
    fn test_leave() {
        assert_eq!(Packet::Leave.encode_to_vec(), vec![0xE2, 0x98, 0xA2, 0x02, 2]);
        roundtrip(Packet::Leave);
    }

    #[test]
    fn test_bad_magic() {
        let datagram = [0xE2, 0x98, 0xA2, 0x01, 1, b'a'];

        assert!(matches!(
            Packet::decode_datagram(&datagram),
            Err(wire::Error::Magic { .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let mut datagram = MAGIC.to_vec();
        datagram.push(9);

        assert!(matches!(
            Packet::decode_datagram(&datagram),
            Err(wire::Error::PacketType { actual: 9 })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut datagram = Packet::Leave.encode_to_vec();
        datagram.push(0);

        assert!(matches!(
            Packet::decode_datagram(&datagram),
            Err(wire::Error::Trailing { left: 1 })
        ));
    }

    #[test]
    fn ack_bitset_len_at_byte_boundary() {
        // Truncated division would also yield 1 byte for 8 fragments, but
        // loses the final byte for 9..=15. Both sides of the boundary:
        assert_eq!(AckBits::size(8), 1);
        assert_eq!(AckBits::size(9), 2);
        assert_eq!(AckBits::size(16), 2);
        assert_eq!(AckBits::size(17), 3);

        // An ACK for a 16-fragment transmission carries exactly two bitset
        // bytes; decoding must consume them and no more.
        let mut bits = AckBits::empty(16);
        bits.set(0);
        bits.set(15);

        let ack = AckHeader {
            packet_id: 7,
            packet_no: 15,
            packet_count: 16,
            bits,
        };
        roundtrip(Packet::Ack(ack.clone()));
        assert!(ack.bits.contains(15));
        assert!(!ack.bits.complete(16));
    }

    #[test]
    fn test_ack_bits() {
        let mut bits = AckBits::empty(11);

        for no in 0..11 {
            assert!(!bits.contains(no));
            bits.set(no);
        }
        assert!(bits.complete(11));
        assert_eq!(bits.zeroes(11).count(), 0);

        bits.unset(3);
        assert!(!bits.complete(11));
        assert_eq!(bits.zeroes(11).collect::<Vec<_>>(), vec![3]);
        assert_eq!(bits.ones(11).count(), 10);

        let mut other = AckBits::empty(11);
        other.set(3);
        bits.union(&other);
        assert!(bits.complete(11));

        bits.difference(&other);
        assert!(!bits.contains(3));
    }

    #[test]
    fn test_data_header_size() {
        let header = DataHeader {
            packet_id: 1,
            packet_no: 0,
            packet_count: 1,
            reliable: true,
            hash: u128::MAX,
        };
        assert_eq!(header.frame(&[]).len(), DataHeader::SIZE);
    }
}
