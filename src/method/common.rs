//! State shared by all methods: packet header, nonce sequencing, replay
//! protection, and session lifetime policy

use std::time::{Duration, Instant};

use rand::Rng;

use crate::buffer::Buffer;

// =============================================================================
// DATA PACKET HEADER
// =============================================================================

/// Packet nonce length on the wire (little-endian).
pub const NONCE_LEN: usize = 6;

/// Common header: 6-byte nonce plus one flags byte.
pub const HEADER_LEN: usize = NONCE_LEN + 1;

/// First invalid nonce value; reaching it ends the session.
pub const NONCE_LIMIT: u64 = 1 << 48;

/// Width of the receive replay window in nonces.
const WINDOW_BITS: u64 = 64;

/// Remaining send nonces below which a refresh is requested, so the
/// handshake completes before the sequence runs dry.
const NONCE_REFRESH_HEADROOM: u64 = 8;

/// Write `nonce` as its 6-byte little-endian wire form.
pub fn write_nonce(nonce: u64) -> [u8; NONCE_LEN] {
    let bytes = nonce.to_le_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]
}

/// Read a 6-byte little-endian wire nonce.
pub fn read_nonce(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..NONCE_LEN].copy_from_slice(&data[..NONCE_LEN]);
    u64::from_le_bytes(bytes)
}

/// Expand a packet nonce to a cipher IV: the nonce bytes lead, the
/// remaining IV bytes are zero.
pub fn expand_nonce(nonce: u64, iv: &mut [u8]) {
    let bytes = write_nonce(nonce);
    let n = bytes.len().min(iv.len());
    iv[..n].copy_from_slice(&bytes[..n]);
    iv[n..].fill(0);
}

/// Prepend the common header to an encrypted packet.
pub fn put_header(buffer: &mut Buffer, nonce: u64, flags: u8) {
    buffer.push_head(&[flags]);
    buffer.push_head(&write_nonce(nonce));
}

/// Parse the common header. Returns (nonce, flags).
pub fn parse_header(data: &[u8]) -> Option<(u64, u8)> {
    if data.len() < HEADER_LEN {
        return None;
    }
    Some((read_nonce(data), data[NONCE_LEN]))
}

// =============================================================================
// SESSION LIFETIME POLICY
// =============================================================================

/// Session timing knobs, taken from the configuration snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Hard session lifetime.
    pub key_valid: Duration,
    /// Grace period a superseded session keeps accepting packets.
    pub key_valid_old: Duration,
    /// Age at which a refresh handshake is requested.
    pub key_refresh: Duration,
    /// Random splay subtracted from the refresh deadline so both sides
    /// don't rekey in lockstep.
    pub key_refresh_splay: Duration,
}

// =============================================================================
// REPLAY WINDOW AND NONCE SEQUENCING
// =============================================================================

/// Admissibility of a received nonce, decided before tag verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCheck {
    /// Ahead of everything seen; accepting advances the window.
    New,
    /// Inside the window, not seen yet; delivery counts as reordered.
    InWindow,
    /// Already accepted once.
    Replayed,
    /// Below the window, or an impossible nonce (zero / wrong parity).
    Rejected,
}

/// Per-session state every method embeds: the send-nonce sequence, the
/// sliding receive window, and the lifetime timestamps.
///
/// The nonce space is split by parity: the handshake initiator sends odd
/// nonces starting at 1, the responder even ones starting at 2, each side
/// incrementing by 2. The receive window is a 64-bit bitmap sliding with
/// the highest accepted nonce.
pub struct CommonSession {
    initiator: bool,
    send_nonce: u64,
    /// Highest receive nonce accepted so far; 0 before the first packet.
    window_max: u64,
    /// Bit `i` set: nonce `window_max - i` was accepted.
    window: u64,
    valid_until: Instant,
    refresh_at: Instant,
    superseded_at: Option<Instant>,
}

impl CommonSession {
    pub fn new(initiator: bool, now: Instant, timing: &SessionTiming) -> Self {
        let splay = if timing.key_refresh_splay.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_secs(rand::thread_rng().gen_range(0..=timing.key_refresh_splay.as_secs()))
        };
        CommonSession {
            initiator,
            send_nonce: if initiator { 1 } else { 2 },
            window_max: 0,
            window: 0,
            valid_until: now + timing.key_valid,
            refresh_at: now + timing.key_refresh.saturating_sub(splay),
            superseded_at: None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.valid_until
    }

    pub fn want_refresh(&self, now: Instant) -> bool {
        now >= self.refresh_at || self.send_nonce + 2 * NONCE_REFRESH_HEADROOM >= NONCE_LIMIT
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_at.is_some()
    }

    /// Mark as superseded: the session keeps decrypting for the grace
    /// period but must not encrypt anymore.
    pub fn set_superseded(&mut self, now: Instant) {
        if self.superseded_at.is_none() {
            self.superseded_at = Some(now);
        }
    }

    /// True once the supersession grace period has passed.
    pub fn ready_to_drop(&self, now: Instant, key_valid_old: Duration) -> bool {
        match self.superseded_at {
            Some(at) => now >= at + key_valid_old,
            None => false,
        }
    }

    /// Claim the next send nonce, or None when the sequence is exhausted.
    pub fn next_send_nonce(&mut self) -> Option<u64> {
        if self.send_nonce >= NONCE_LIMIT {
            return None;
        }
        let nonce = self.send_nonce;
        self.send_nonce += 2;
        Some(nonce)
    }

    /// Read-only admissibility check; call before tag verification.
    pub fn check_receive(&self, nonce: u64) -> ReplayCheck {
        if nonce == 0 || nonce >= NONCE_LIMIT {
            return ReplayCheck::Rejected;
        }
        // We receive the peer's sequence, which has the opposite parity.
        let expect_odd = !self.initiator;
        if (nonce % 2 == 1) != expect_odd {
            return ReplayCheck::Rejected;
        }
        if nonce > self.window_max {
            return ReplayCheck::New;
        }
        let offset = self.window_max - nonce;
        if offset >= WINDOW_BITS {
            return ReplayCheck::Rejected;
        }
        if self.window & (1 << offset) != 0 {
            ReplayCheck::Replayed
        } else {
            ReplayCheck::InWindow
        }
    }

    /// Record an accepted nonce after its tag verified. Returns true if
    /// the packet arrived out of order.
    pub fn commit_receive(&mut self, nonce: u64) -> bool {
        if nonce > self.window_max {
            let shift = nonce - self.window_max;
            self.window = if shift >= WINDOW_BITS { 0 } else { self.window << shift };
            self.window |= 1;
            self.window_max = nonce;
            false
        } else {
            self.window |= 1 << (self.window_max - nonce);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> SessionTiming {
        SessionTiming {
            key_valid: Duration::from_secs(3600),
            key_valid_old: Duration::from_secs(60),
            key_refresh: Duration::from_secs(3300),
            key_refresh_splay: Duration::from_secs(0),
        }
    }

    #[test]
    fn test_nonce_wire_roundtrip() {
        for nonce in [1u64, 2, 0xdead, NONCE_LIMIT - 1] {
            assert_eq!(read_nonce(&write_nonce(nonce)), nonce);
        }
    }

    #[test]
    fn test_nonce_parity_sequences() {
        let now = Instant::now();
        let mut initiator = CommonSession::new(true, now, &timing());
        let mut responder = CommonSession::new(false, now, &timing());
        assert_eq!(initiator.next_send_nonce(), Some(1));
        assert_eq!(initiator.next_send_nonce(), Some(3));
        assert_eq!(responder.next_send_nonce(), Some(2));
        assert_eq!(responder.next_send_nonce(), Some(4));
    }

    #[test]
    fn test_replay_window_accepts_once() {
        let now = Instant::now();
        // Responder receives the initiator's odd sequence.
        let mut s = CommonSession::new(false, now, &timing());
        assert_eq!(s.check_receive(1), ReplayCheck::New);
        assert!(!s.commit_receive(1));
        assert_eq!(s.check_receive(1), ReplayCheck::Replayed);

        assert_eq!(s.check_receive(5), ReplayCheck::New);
        assert!(!s.commit_receive(5));
        assert_eq!(s.check_receive(3), ReplayCheck::InWindow);
        assert!(s.commit_receive(3));
        assert_eq!(s.check_receive(3), ReplayCheck::Replayed);
    }

    #[test]
    fn test_replay_window_parity_and_bounds() {
        let now = Instant::now();
        let mut s = CommonSession::new(false, now, &timing());
        // Even nonces come from a responder; we are the responder here.
        assert_eq!(s.check_receive(2), ReplayCheck::Rejected);
        assert_eq!(s.check_receive(0), ReplayCheck::Rejected);

        s.commit_receive(201);
        // 64 or more behind the newest is out of the window.
        assert_eq!(s.check_receive(201 - 64), ReplayCheck::Rejected);
        assert_eq!(s.check_receive(73), ReplayCheck::Rejected);
        // Just inside still works.
        assert_eq!(s.check_receive(201 - 62), ReplayCheck::InWindow);
    }

    #[test]
    fn test_window_slides_past_gap() {
        let now = Instant::now();
        let mut s = CommonSession::new(false, now, &timing());
        s.commit_receive(1);
        // A jump beyond the window width clears all history.
        assert!(!s.commit_receive(1 + 2 * 100));
        assert_eq!(s.check_receive(1), ReplayCheck::Rejected);
    }

    #[test]
    fn test_refresh_near_nonce_exhaustion() {
        let now = Instant::now();
        let mut s = CommonSession::new(true, now, &timing());
        assert!(!s.want_refresh(now));
        s.send_nonce = NONCE_LIMIT - 2 * NONCE_REFRESH_HEADROOM;
        assert!(s.want_refresh(now));
    }

    #[test]
    fn test_nonce_exhaustion_stops_send() {
        let now = Instant::now();
        let mut s = CommonSession::new(true, now, &timing());
        s.send_nonce = NONCE_LIMIT - 1;
        assert_eq!(s.next_send_nonce(), Some(NONCE_LIMIT - 1));
        assert_eq!(s.next_send_nonce(), None);
    }

    #[test]
    fn test_supersession_grace_period() {
        let now = Instant::now();
        let mut s = CommonSession::new(true, now, &timing());
        assert!(!s.is_superseded());
        s.set_superseded(now);
        assert!(s.is_superseded());
        assert!(!s.ready_to_drop(now, Duration::from_secs(60)));
        assert!(s.ready_to_drop(now + Duration::from_secs(61), Duration::from_secs(60)));
    }
}
