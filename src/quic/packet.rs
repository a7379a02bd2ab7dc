//! Packet implementation
//!
//! Packet headers, packet numbers, and sealing/opening of packet payloads
//! through the connection's packet protection.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::crypto::PacketProtection;
use crate::quic::connection::{CONNECTION_ID_LEN, ConnectionId, Side};
use crate::quic::error::{PacketError, ProtocolError, Result};
use crate::quic::frame::{encode_varint, read_varint, varint_len};

/// Version carried in long headers ("qux1")
pub const PROTOCOL_VERSION: u32 = 0x7175_7831;

/// Largest UDP payload the engine will ever build or accept
pub const MAX_DATAGRAM_SIZE: usize = 65527;

const LONG_HEADER_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const TYPE_MASK: u8 = 0x3f;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Client packets sent before anything has been heard from the server
    Initial,
    /// Everything else
    OneRtt,
}

impl PacketType {
    /// Get packet type from byte value
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(PacketType::Initial),
            0x04 => Some(PacketType::OneRtt),
            _ => None,
        }
    }

    /// Convert packet type to byte value
    pub fn to_byte(self) -> u8 {
        match self {
            PacketType::Initial => 0x00,
            PacketType::OneRtt => 0x04,
        }
    }

    /// Check if this is a long header packet
    pub fn is_long_header(self) -> bool {
        matches!(self, PacketType::Initial)
    }
}

/// Packet number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketNumber(u64);

impl PacketNumber {
    /// Create a new packet number
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the packet number value
    pub fn value(self) -> u64 {
        self.0
    }

    /// Get the next packet number
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub connection_id: ConnectionId,
    pub packet_number: PacketNumber,
    /// Present on long headers only
    pub version: Option<u32>,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType, connection_id: ConnectionId, packet_number: PacketNumber) -> Self {
        Self {
            packet_type,
            connection_id,
            packet_number,
            version: packet_type.is_long_header().then_some(PROTOCOL_VERSION),
        }
    }

    pub fn encoded_len(&self) -> usize {
        let version_len = if self.packet_type.is_long_header() { 4 } else { 0 };
        1 + version_len + CONNECTION_ID_LEN + varint_len(self.packet_number.value())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf.freeze()
    }

    pub fn encode_to(&self, buf: &mut BytesMut) {
        let mut first = FIXED_BIT | self.packet_type.to_byte();
        if self.packet_type.is_long_header() {
            first |= LONG_HEADER_BIT;
        }
        buf.put_u8(first);
        if self.packet_type.is_long_header() {
            buf.put_u32(self.version.unwrap_or(PROTOCOL_VERSION));
        }
        buf.put_slice(self.connection_id.as_bytes());
        encode_varint(buf, self.packet_number.value());
    }

    /// Decode a header, returning it with its length in bytes
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = data;
        let (&first, rest) = cursor
            .split_first()
            .ok_or(PacketError::TooSmall { size: data.len() })?;
        cursor = rest;

        if first & FIXED_BIT == 0 {
            return Err(PacketError::InvalidHeader.into());
        }
        let packet_type =
            PacketType::from_byte(first & TYPE_MASK).ok_or(PacketError::UnsupportedType(first & TYPE_MASK))?;
        let long = first & LONG_HEADER_BIT != 0;
        if long != packet_type.is_long_header() {
            return Err(PacketError::InvalidHeader.into());
        }

        let version = if long {
            if cursor.len() < 4 {
                return Err(PacketError::IncompleteData.into());
            }
            let (bytes, rest) = cursor.split_at(4);
            cursor = rest;
            let version = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if version != PROTOCOL_VERSION {
                return Err(ProtocolError::UnsupportedVersion(version).into());
            }
            Some(version)
        } else {
            None
        };

        if cursor.len() < CONNECTION_ID_LEN {
            return Err(PacketError::IncompleteData.into());
        }
        let (cid, rest) = cursor.split_at(CONNECTION_ID_LEN);
        cursor = rest;
        let connection_id = ConnectionId::from_slice(cid).ok_or(PacketError::InvalidHeader)?;
        let packet_number = PacketNumber::new(
            read_varint(&mut cursor).map_err(|_| PacketError::IncompleteData)?,
        );

        let header = Self {
            packet_type,
            connection_id,
            packet_number,
            version,
        };
        Ok((header, data.len() - cursor.len()))
    }
}

/// A decrypted packet: header plus plaintext frame payload
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Encode the header and seal the payload into a datagram
    pub fn seal(&self, sender: Side, protection: &dyn PacketProtection) -> Result<Vec<u8>> {
        let header = self.header.encode();
        let sealed = protection.seal(sender, self.header.packet_number.value(), &header, &self.payload)?;
        let size = header.len() + sealed.len();
        if size > MAX_DATAGRAM_SIZE {
            return Err(PacketError::TooLarge {
                size,
                max: MAX_DATAGRAM_SIZE,
            }
            .into());
        }
        let mut datagram = Vec::with_capacity(size);
        datagram.extend_from_slice(&header);
        datagram.extend_from_slice(&sealed);
        Ok(datagram)
    }

    /// Open a datagram whose header has already been decoded
    pub fn open(
        header: PacketHeader,
        header_bytes: &[u8],
        body: &[u8],
        sender: Side,
        protection: &dyn PacketProtection,
    ) -> Result<Self> {
        let payload = protection.open(sender, header.packet_number.value(), header_bytes, body)?;
        Ok(Self {
            header,
            payload: Bytes::from(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ChaChaProtection, Plaintext};

    fn cid() -> ConnectionId {
        ConnectionId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8])
    }

    #[test]
    fn test_long_header_round_trip() {
        let header = PacketHeader::new(PacketType::Initial, cid(), PacketNumber::new(70));
        let encoded = header.encode();
        assert_eq!(encoded.len(), header.encoded_len());
        assert_eq!(encoded[0] & LONG_HEADER_BIT, LONG_HEADER_BIT);

        let (decoded, len) = PacketHeader::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        assert_eq!(decoded, header);
        assert_eq!(decoded.version, Some(PROTOCOL_VERSION));
    }

    #[test]
    fn test_short_header_has_no_version() {
        let header = PacketHeader::new(PacketType::OneRtt, cid(), PacketNumber::new(1 << 20));
        let encoded = header.encode();
        assert_eq!(encoded.len(), 1 + CONNECTION_ID_LEN + 4);
        let (decoded, _) = PacketHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.version, None);
        assert_eq!(decoded.packet_number.value(), 1 << 20);
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(PacketHeader::decode(&[]).is_err());
        // fixed bit clear
        assert!(PacketHeader::decode(&[0x04, 0, 0]).is_err());
        // long bit on a short type
        assert!(PacketHeader::decode(&[0xC4, 0, 0, 0, 0]).is_err());

        let mut encoded = PacketHeader::new(PacketType::Initial, cid(), PacketNumber::new(0))
            .encode()
            .to_vec();
        encoded[1] ^= 0xff;
        assert!(PacketHeader::decode(&encoded).is_err());

        let short = PacketHeader::new(PacketType::OneRtt, cid(), PacketNumber::new(0)).encode();
        assert!(PacketHeader::decode(&short[..5]).is_err());
    }

    #[test]
    fn test_seal_and_open_plaintext() {
        let header = PacketHeader::new(PacketType::OneRtt, cid(), PacketNumber::new(3));
        let packet = Packet::new(header.clone(), Bytes::from_static(b"\x01"));
        let datagram = packet.seal(Side::Server, &Plaintext).unwrap();

        let (decoded, len) = PacketHeader::decode(&datagram).unwrap();
        let opened = Packet::open(decoded, &datagram[..len], &datagram[len..], Side::Server, &Plaintext).unwrap();
        assert_eq!(opened.header, header);
        assert_eq!(&opened.payload[..], b"\x01");
    }

    #[test]
    fn test_sealed_header_is_authenticated() {
        let protection = ChaChaProtection::new(&[9u8; 32], &cid()).unwrap();
        let header = PacketHeader::new(PacketType::OneRtt, cid(), PacketNumber::new(5));
        let packet = Packet::new(header, Bytes::from_static(b"payload"));
        let mut datagram = packet.seal(Side::Client, &protection).unwrap();

        // flip the packet number: header decodes, authentication fails
        let last_header_byte = 1 + CONNECTION_ID_LEN;
        datagram[last_header_byte] ^= 0x01;
        let (decoded, len) = PacketHeader::decode(&datagram).unwrap();
        assert!(Packet::open(decoded, &datagram[..len], &datagram[len..], Side::Client, &protection).is_err());
    }
}
