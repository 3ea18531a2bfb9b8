//! TLV record codec for handshake packets
//!
//! A handshake packet is a one-byte packet type followed by a stream of
//! records: `type: u16 LE | length: u16 LE | value`. At most one record of
//! each type may appear; unknown record types are skipped so newer peers
//! can add records without breaking older ones.

use crate::types::Mode;

/// Record types carried in handshake packets.
///
/// Types 6 through 10 are payload slots owned by the key-exchange
/// protocol named in `ProtocolName`; their meaning here follows the
/// Curve25519 exchange: long-term keys, ephemerals, confirmation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordType {
    HandshakeType = 0,
    ReplyCode = 1,
    ErrorDetail = 2,
    Flags = 3,
    Mode = 4,
    ProtocolName = 5,
    SenderKey = 6,
    RecipientKey = 7,
    SenderEphemeral = 8,
    RecipientEphemeral = 9,
    ConfirmationTag = 10,
    Mtu = 11,
    MethodName = 12,
}

/// Number of known record types; the parse array is indexed by type.
pub const RECORD_MAX: usize = 13;

impl RecordType {
    pub fn from_u16(value: u16) -> Option<Self> {
        use RecordType::*;
        Some(match value {
            0 => HandshakeType,
            1 => ReplyCode,
            2 => ErrorDetail,
            3 => Flags,
            4 => Mode,
            5 => ProtocolName,
            6 => SenderKey,
            7 => RecipientKey,
            8 => SenderEphemeral,
            9 => RecipientEphemeral,
            10 => ConfirmationTag,
            11 => Mtu,
            12 => MethodName,
            _ => return None,
        })
    }
}

/// Reply codes sent back on handshake errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Success = 0,
    MandatoryMissing = 1,
    UnacceptableValue = 2,
}

impl ReplyCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ReplyCode::Success),
            1 => Some(ReplyCode::MandatoryMissing),
            2 => Some(ReplyCode::UnacceptableValue),
            _ => None,
        }
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// Parsed record set: one optional value slot per known record type.
#[derive(Default)]
pub struct RecordSet {
    slots: [Option<Vec<u8>>; RECORD_MAX],
}

/// Why a handshake packet failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Record header or value ran past the end of the packet.
    Truncated,
    /// The same record type appeared twice.
    Duplicate(RecordType),
}

impl RecordSet {
    /// Parse the record stream of a handshake packet (type byte already
    /// stripped).
    pub fn parse(data: &[u8]) -> Result<RecordSet, ParseError> {
        let mut set = RecordSet::default();
        let mut pos = 0;

        while pos < data.len() {
            if pos + 4 > data.len() {
                return Err(ParseError::Truncated);
            }
            let record_type = u16::from_le_bytes([data[pos], data[pos + 1]]);
            let length = u16::from_le_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 4;

            if pos + length > data.len() {
                return Err(ParseError::Truncated);
            }
            let value = &data[pos..pos + length];
            pos += length;

            // Unknown types are tolerated for forward compatibility.
            let Some(known) = RecordType::from_u16(record_type) else {
                continue;
            };
            let slot = &mut set.slots[known as usize];
            if slot.is_some() {
                return Err(ParseError::Duplicate(known));
            }
            *slot = Some(value.to_vec());
        }

        Ok(set)
    }

    pub fn get(&self, record_type: RecordType) -> Option<&[u8]> {
        self.slots[record_type as usize].as_deref()
    }

    pub fn get_u8(&self, record_type: RecordType) -> Option<u8> {
        match self.get(record_type)? {
            [value] => Some(*value),
            _ => None,
        }
    }

    pub fn get_u16(&self, record_type: RecordType) -> Option<u16> {
        match self.get(record_type)? {
            [lo, hi] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }

    pub fn get_str(&self, record_type: RecordType) -> Option<&str> {
        std::str::from_utf8(self.get(record_type)?).ok()
    }

    pub fn get_key(&self, record_type: RecordType) -> Option<[u8; 32]> {
        let value = self.get(record_type)?;
        value.try_into().ok()
    }

    pub fn get_mode(&self) -> Option<Mode> {
        Mode::from_byte(self.get_u8(RecordType::Mode)?)
    }
}

// =============================================================================
// BUILDING
// =============================================================================

/// Handshake packet builder; starts with the packet-type byte.
pub struct HandshakeBuilder {
    data: Vec<u8>,
}

impl HandshakeBuilder {
    pub fn new() -> Self {
        HandshakeBuilder { data: vec![crate::types::PacketType::Handshake as u8] }
    }

    pub fn add(&mut self, record_type: RecordType, value: &[u8]) -> &mut Self {
        debug_assert!(value.len() <= u16::MAX as usize);
        self.data.extend_from_slice(&(record_type as u16).to_le_bytes());
        self.data.extend_from_slice(&(value.len() as u16).to_le_bytes());
        self.data.extend_from_slice(value);
        self
    }

    pub fn add_u8(&mut self, record_type: RecordType, value: u8) -> &mut Self {
        self.add(record_type, &[value])
    }

    pub fn add_u16(&mut self, record_type: RecordType, value: u16) -> &mut Self {
        self.add(record_type, &value.to_le_bytes())
    }

    pub fn add_str(&mut self, record_type: RecordType, value: &str) -> &mut Self {
        self.add(record_type, value.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

impl Default for HandshakeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_parse_roundtrip() {
        let mut builder = HandshakeBuilder::new();
        builder
            .add_u8(RecordType::HandshakeType, 1)
            .add_u8(RecordType::Mode, Mode::Tap as u8)
            .add_u16(RecordType::Mtu, 1500)
            .add_str(RecordType::ProtocolName, "ec25519-fhmqvc")
            .add(RecordType::SenderKey, &[7u8; 32]);
        let packet = builder.finish();
        assert_eq!(packet[0], 1);

        let records = RecordSet::parse(&packet[1..]).unwrap();
        assert_eq!(records.get_u8(RecordType::HandshakeType), Some(1));
        assert_eq!(records.get_mode(), Some(Mode::Tap));
        assert_eq!(records.get_u16(RecordType::Mtu), Some(1500));
        assert_eq!(records.get_str(RecordType::ProtocolName), Some("ec25519-fhmqvc"));
        assert_eq!(records.get_key(RecordType::SenderKey), Some([7u8; 32]));
        assert!(records.get(RecordType::MethodName).is_none());
    }

    #[test]
    fn test_unknown_record_types_tolerated() {
        let mut packet = Vec::new();
        // Unknown type 0x4000.
        packet.extend_from_slice(&0x4000u16.to_le_bytes());
        packet.extend_from_slice(&2u16.to_le_bytes());
        packet.extend_from_slice(&[0xaa, 0xbb]);
        // Known record after it.
        packet.extend_from_slice(&(RecordType::HandshakeType as u16).to_le_bytes());
        packet.extend_from_slice(&1u16.to_le_bytes());
        packet.push(2);

        let records = RecordSet::parse(&packet).unwrap();
        assert_eq!(records.get_u8(RecordType::HandshakeType), Some(2));
    }

    #[test]
    fn test_truncated_value_rejected() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&(RecordType::SenderKey as u16).to_le_bytes());
        packet.extend_from_slice(&32u16.to_le_bytes());
        packet.extend_from_slice(&[1u8; 16]);
        assert!(matches!(RecordSet::parse(&packet), Err(ParseError::Truncated)));
    }

    #[test]
    fn test_duplicate_record_rejected() {
        let mut builder = HandshakeBuilder::new();
        builder.add_u8(RecordType::Flags, 0).add_u8(RecordType::Flags, 0);
        let packet = builder.finish();
        assert!(matches!(
            RecordSet::parse(&packet[1..]),
            Err(ParseError::Duplicate(RecordType::Flags))
        ));
    }

    #[test]
    fn test_wrong_width_values_rejected() {
        let mut builder = HandshakeBuilder::new();
        builder.add(RecordType::Mtu, &[1, 2, 3]).add(RecordType::SenderKey, &[1u8; 31]);
        let packet = builder.finish();
        let records = RecordSet::parse(&packet[1..]).unwrap();
        assert_eq!(records.get_u16(RecordType::Mtu), None);
        assert_eq!(records.get_key(RecordType::SenderKey), None);
    }
}
