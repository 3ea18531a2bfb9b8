//! Handshake packets: record framing, packet construction, validation
//!
//! The key-exchange state machine lives with the peer table; this module
//! owns the wire format. Every handshake packet names the key-exchange
//! protocol, the tunnel mode, and the MTU, so misconfigured pairs fail
//! loudly at connection time instead of corrupting traffic later.

pub mod fhmqvc;
pub mod records;

use thiserror::Error;

use crate::types::{Mode, PublicKeyBytes};
use fhmqvc::PROTOCOL_NAME;
use records::{HandshakeBuilder, ParseError, RecordSet, RecordType, ReplyCode};

/// Handshake stage carried in the handshake-type record.
pub const HANDSHAKE_INIT: u8 = 1;
pub const HANDSHAKE_RESPONSE: u8 = 2;
pub const HANDSHAKE_FINISH: u8 = 3;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("malformed handshake packet")]
    Malformed,
    #[error("duplicate record {0:?}")]
    Duplicate(RecordType),
    #[error("mandatory record {0:?} missing")]
    MissingRecord(RecordType),
    #[error("unacceptable value in record {0:?}")]
    UnacceptableValue(RecordType),
}

impl HandshakeError {
    /// Reply code reported back to the sender.
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            HandshakeError::MissingRecord(_) => ReplyCode::MandatoryMissing,
            _ => ReplyCode::UnacceptableValue,
        }
    }

    /// Record the error refers to, for the error-detail record.
    pub fn detail(&self) -> Option<RecordType> {
        match self {
            HandshakeError::Malformed => None,
            HandshakeError::Duplicate(r) => Some(*r),
            HandshakeError::MissingRecord(r) => Some(*r),
            HandshakeError::UnacceptableValue(r) => Some(*r),
        }
    }
}

/// A parsed handshake packet.
pub struct HandshakePacket {
    pub handshake_type: u8,
    pub records: RecordSet,
}

/// Parse a handshake packet (leading packet-type byte already stripped).
pub fn parse(data: &[u8]) -> Result<HandshakePacket, HandshakeError> {
    let records = RecordSet::parse(data).map_err(|e| match e {
        ParseError::Truncated => HandshakeError::Malformed,
        ParseError::Duplicate(r) => HandshakeError::Duplicate(r),
    })?;
    let handshake_type = records
        .get_u8(RecordType::HandshakeType)
        .ok_or(HandshakeError::MissingRecord(RecordType::HandshakeType))?;
    if !(HANDSHAKE_INIT..=HANDSHAKE_FINISH).contains(&handshake_type) {
        return Err(HandshakeError::UnacceptableValue(RecordType::HandshakeType));
    }
    Ok(HandshakePacket { handshake_type, records })
}

impl HandshakePacket {
    /// Reply code carried by this packet, if it is an error reply.
    pub fn error_reply(&self) -> Option<(ReplyCode, Option<u8>)> {
        match self.records.get_u8(RecordType::ReplyCode).map(ReplyCode::from_byte) {
            Some(Some(ReplyCode::Success)) | None => None,
            Some(Some(code)) => Some((code, self.records.get_u8(RecordType::ErrorDetail))),
            Some(None) => Some((ReplyCode::UnacceptableValue, None)),
        }
    }

    /// Validate protocol name, mode, and MTU against our configuration.
    pub fn validate_common(&self, mode: Mode, mtu: u16) -> Result<(), HandshakeError> {
        let name = self
            .records
            .get_str(RecordType::ProtocolName)
            .ok_or(HandshakeError::MissingRecord(RecordType::ProtocolName))?;
        if name != PROTOCOL_NAME {
            return Err(HandshakeError::UnacceptableValue(RecordType::ProtocolName));
        }

        let peer_mode = self
            .records
            .get_mode()
            .ok_or(HandshakeError::MissingRecord(RecordType::Mode))?;
        if peer_mode != mode {
            return Err(HandshakeError::UnacceptableValue(RecordType::Mode));
        }

        let peer_mtu = self
            .records
            .get_u16(RecordType::Mtu)
            .ok_or(HandshakeError::MissingRecord(RecordType::Mtu))?;
        if peer_mtu != mtu {
            return Err(HandshakeError::UnacceptableValue(RecordType::Mtu));
        }

        Ok(())
    }

    /// A 32-byte key record, mandatory.
    pub fn require_key(&self, record: RecordType) -> Result<PublicKeyBytes, HandshakeError> {
        match self.records.get(record) {
            None => Err(HandshakeError::MissingRecord(record)),
            Some(value) => value
                .try_into()
                .map_err(|_| HandshakeError::UnacceptableValue(record)),
        }
    }
}

// =============================================================================
// PACKET CONSTRUCTION
// =============================================================================

/// Fields common to every handshake packet we send.
pub struct HandshakeContext {
    pub mode: Mode,
    pub mtu: u16,
    pub our_key: PublicKeyBytes,
}

fn base_packet(ctx: &HandshakeContext, handshake_type: u8) -> HandshakeBuilder {
    let mut builder = HandshakeBuilder::new();
    builder
        .add_u8(RecordType::HandshakeType, handshake_type)
        .add_u8(RecordType::Mode, ctx.mode as u8)
        .add_u16(RecordType::Mtu, ctx.mtu)
        .add_str(RecordType::ProtocolName, PROTOCOL_NAME)
        .add(RecordType::SenderKey, &ctx.our_key);
    builder
}

/// Init: opens an exchange. The recipient key is included when we know
/// who we are talking to (it is omitted only for floating peers contacted
/// by address).
pub fn build_init(
    ctx: &HandshakeContext,
    recipient: Option<&PublicKeyBytes>,
    our_eph: &PublicKeyBytes,
) -> Vec<u8> {
    let mut builder = base_packet(ctx, HANDSHAKE_INIT);
    if let Some(key) = recipient {
        builder.add(RecordType::RecipientKey, key);
    }
    builder.add(RecordType::SenderEphemeral, our_eph);
    builder.finish()
}

/// Response: answers an Init, echoing the initiator's ephemeral and
/// proving key possession with the responder confirmation tag.
pub fn build_response(
    ctx: &HandshakeContext,
    recipient: &PublicKeyBytes,
    our_eph: &PublicKeyBytes,
    peer_eph: &PublicKeyBytes,
    confirm_tag: &[u8],
) -> Vec<u8> {
    let mut builder = base_packet(ctx, HANDSHAKE_RESPONSE);
    builder
        .add(RecordType::RecipientKey, recipient)
        .add(RecordType::SenderEphemeral, our_eph)
        .add(RecordType::RecipientEphemeral, peer_eph)
        .add(RecordType::ConfirmationTag, confirm_tag);
    builder.finish()
}

/// Finish: completes the exchange and names the session method.
pub fn build_finish(
    ctx: &HandshakeContext,
    recipient: &PublicKeyBytes,
    our_eph: &PublicKeyBytes,
    peer_eph: &PublicKeyBytes,
    confirm_tag: &[u8],
    method: &str,
) -> Vec<u8> {
    let mut builder = base_packet(ctx, HANDSHAKE_FINISH);
    builder
        .add(RecordType::RecipientKey, recipient)
        .add(RecordType::SenderEphemeral, our_eph)
        .add(RecordType::RecipientEphemeral, peer_eph)
        .add(RecordType::ConfirmationTag, confirm_tag)
        .add_str(RecordType::MethodName, method);
    builder.finish()
}

/// Error reply to a failed handshake stage: echoes the next stage number
/// with a reply code and the offending record type.
pub fn build_error_reply(
    ctx: &HandshakeContext,
    in_reply_to: u8,
    code: ReplyCode,
    detail: Option<RecordType>,
) -> Vec<u8> {
    let mut builder = base_packet(ctx, in_reply_to.saturating_add(1));
    builder.add_u8(RecordType::ReplyCode, code as u8);
    if let Some(record) = detail {
        builder.add_u8(RecordType::ErrorDetail, record as u16 as u8);
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HandshakeContext {
        HandshakeContext { mode: Mode::Tap, mtu: 1500, our_key: [9u8; 32] }
    }

    #[test]
    fn test_init_packet_shape() {
        let packet = build_init(&ctx(), Some(&[5u8; 32]), &[6u8; 32]);
        assert_eq!(packet[0], crate::types::PacketType::Handshake as u8);

        let parsed = parse(&packet[1..]).unwrap();
        assert_eq!(parsed.handshake_type, HANDSHAKE_INIT);
        assert!(parsed.validate_common(Mode::Tap, 1500).is_ok());
        assert_eq!(parsed.require_key(RecordType::SenderKey).unwrap(), [9u8; 32]);
        assert_eq!(parsed.require_key(RecordType::RecipientKey).unwrap(), [5u8; 32]);
        assert!(parsed.error_reply().is_none());
    }

    #[test]
    fn test_mode_and_mtu_mismatch_rejected() {
        let packet = build_init(&ctx(), None, &[6u8; 32]);
        let parsed = parse(&packet[1..]).unwrap();
        assert!(matches!(
            parsed.validate_common(Mode::Tun, 1500),
            Err(HandshakeError::UnacceptableValue(RecordType::Mode))
        ));
        assert!(matches!(
            parsed.validate_common(Mode::Tap, 1280),
            Err(HandshakeError::UnacceptableValue(RecordType::Mtu))
        ));
    }

    #[test]
    fn test_error_reply_roundtrip() {
        let packet = build_error_reply(
            &ctx(),
            HANDSHAKE_INIT,
            ReplyCode::MandatoryMissing,
            Some(RecordType::SenderEphemeral),
        );
        let parsed = parse(&packet[1..]).unwrap();
        assert_eq!(parsed.handshake_type, HANDSHAKE_RESPONSE);
        let (code, detail) = parsed.error_reply().unwrap();
        assert_eq!(code, ReplyCode::MandatoryMissing);
        assert_eq!(detail, Some(RecordType::SenderEphemeral as u16 as u8));
    }

    #[test]
    fn test_missing_mandatory_record_maps_to_reply() {
        let err = HandshakeError::MissingRecord(RecordType::SenderKey);
        assert_eq!(err.reply_code(), ReplyCode::MandatoryMissing);
        let err = HandshakeError::UnacceptableValue(RecordType::Mtu);
        assert_eq!(err.reply_code(), ReplyCode::UnacceptableValue);
    }

    #[test]
    fn test_handshake_type_bounds() {
        let mut builder = HandshakeBuilder::new();
        builder.add_u8(RecordType::HandshakeType, 4);
        let packet = builder.finish();
        assert!(matches!(
            parse(&packet[1..]),
            Err(HandshakeError::UnacceptableValue(RecordType::HandshakeType))
        ));
    }
}
