//! Shared wire-level constants and small types

use std::fmt;

// =============================================================================
// PACKET TYPES
// =============================================================================

/// Leading byte of every datagram on the tunnel port.
///
/// The type byte is prepended at send time and stripped before the payload
/// reaches the session layer, so data packets and handshake packets share
/// one socket without ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Encrypted/authenticated payload under an established session
    Data = 0,
    /// Key-exchange packet (TLV records)
    Handshake = 1,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Handshake),
            _ => None,
        }
    }
}

// =============================================================================
// TUNNEL MODE
// =============================================================================

/// What the tunnel carries: full Ethernet frames or bare IP packets.
///
/// The mode is part of the handshake; both sides must agree. TAP mode adds
/// Ethernet-address learning so multiple peers can share one interface,
/// TUN mode forwards everything to the single configured peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Ethernet frames (layer 2)
    Tap = 0,
    /// IP packets (layer 3)
    Tun = 1,
}

impl Mode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Mode::Tap),
            1 => Some(Mode::Tun),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Tap => write!(f, "TAP"),
            Mode::Tun => write!(f, "TUN"),
        }
    }
}

// =============================================================================
// ETHERNET ADDRESSES
// =============================================================================

/// Length of an Ethernet hardware address.
pub const ETH_ALEN: usize = 6;

/// Length of an Ethernet header (dst + src + ethertype).
pub const ETH_HLEN: usize = 14;

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthAddr(pub [u8; ETH_ALEN]);

impl EthAddr {
    /// Group bit set: broadcast or multicast destination.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 1 != 0
    }

    /// Destination address of a frame, if the frame is long enough.
    pub fn destination(frame: &[u8]) -> Option<EthAddr> {
        if frame.len() < ETH_HLEN {
            return None;
        }
        let mut addr = [0u8; ETH_ALEN];
        addr.copy_from_slice(&frame[..ETH_ALEN]);
        Some(EthAddr(addr))
    }

    /// Source address of a frame, if the frame is long enough.
    pub fn source(frame: &[u8]) -> Option<EthAddr> {
        if frame.len() < ETH_HLEN {
            return None;
        }
        let mut addr = [0u8; ETH_ALEN];
        addr.copy_from_slice(&frame[ETH_ALEN..2 * ETH_ALEN]);
        Some(EthAddr(addr))
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

// =============================================================================
// KEY MATERIAL
// =============================================================================

/// A Curve25519 public key on the wire.
pub type PublicKeyBytes = [u8; 32];

/// Short key fingerprint for logging.
pub fn key_fingerprint(key: &PublicKeyBytes) -> String {
    hex::encode(&key[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eth_addr_parsing() {
        let frame: [u8; 14] = [
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0x08, 0x00,
        ];
        let dst = EthAddr::destination(&frame).unwrap();
        let src = EthAddr::source(&frame).unwrap();
        assert!(dst.is_multicast());
        assert!(!src.is_multicast());
        assert_eq!(src.to_string(), "02:00:00:00:00:01");
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(EthAddr::destination(&[0u8; 13]).is_none());
        assert!(EthAddr::source(&[0u8; 13]).is_none());
    }

    #[test]
    fn test_packet_type_demux() {
        assert_eq!(PacketType::from_byte(0), Some(PacketType::Data));
        assert_eq!(PacketType::from_byte(1), Some(PacketType::Handshake));
        assert_eq!(PacketType::from_byte(2), None);
    }
}
