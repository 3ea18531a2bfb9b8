//! composed-gmac methods: any cipher combined with GMAC, with a second
//! cipher generating the GHASH key and tag mask
//!
//! Names follow `<cipher>+<gmac-cipher>-gmac`; the short form
//! `<cipher>-gmac` keys the same algorithm independently for both roles.
//! Block ciphers resolve through their counter-mode registry entry, so
//! `aes128` becomes `aes128-ctr`. Combining the null cipher with GMAC
//! yields unencrypted, authenticated-only methods.

use std::time::Instant;

use crate::buffer::Buffer;
use crate::crypto::mac::TAG_LEN;
use crate::crypto::{cipher_get, mac_get, Cipher, CipherState, ImplSelection, Mac, MacState};

use super::common::{
    expand_nonce, parse_header, put_header, CommonSession, ReplayCheck, SessionTiming, HEADER_LEN,
    NONCE_LEN,
};
use super::{DecryptedPacket, MethodError, MethodProvider, MethodSession, MethodSpace};

const BLOCK_LEN: usize = 16;
const ZERO_BLOCK: [u8; BLOCK_LEN] = [0u8; BLOCK_LEN];

pub struct ComposedGmacProvider {
    name: String,
    cipher: &'static (dyn Cipher + Sync),
    gmac_cipher: &'static (dyn Cipher + Sync),
    ghash: &'static (dyn Mac + Sync),
}

/// Resolve a cipher name, falling back to its counter-mode entry.
fn resolve_cipher(name: &str, selection: &ImplSelection) -> Option<&'static (dyn Cipher + Sync)> {
    if let Some(cipher) = cipher_get(name, selection) {
        return Some(cipher);
    }
    if !name.ends_with("-ctr") {
        return cipher_get(&format!("{}-ctr", name), selection);
    }
    None
}

/// Instantiate a composed-gmac method from its configured name, or None
/// if the name does not belong to this provider family.
pub fn create_by_name(name: &str, selection: &ImplSelection) -> Option<ComposedGmacProvider> {
    let stem = name.strip_suffix("-gmac")?;

    let (cipher_name, gmac_name) = match stem.split_once('+') {
        Some((c, g)) if !c.is_empty() && !g.is_empty() && !g.contains('+') => (c, g),
        Some(_) => return None,
        None if !stem.is_empty() => (stem, stem),
        None => return None,
    };

    let cipher = resolve_cipher(cipher_name, selection)?;
    let gmac_cipher = resolve_cipher(gmac_name, selection)?;
    let ghash = mac_get("ghash", selection)?;

    // The packet nonce must fit into the authentication cipher's IV with
    // room to spare, and into the data cipher's IV unless it has none.
    if gmac_cipher.iv_length() <= NONCE_LEN {
        return None;
    }
    if cipher.iv_length() != 0 && cipher.iv_length() <= NONCE_LEN {
        return None;
    }

    Some(ComposedGmacProvider { name: name.to_string(), cipher, gmac_cipher, ghash })
}

impl MethodProvider for ComposedGmacProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn space(&self) -> MethodSpace {
        MethodSpace {
            max_overhead: HEADER_LEN + TAG_LEN,
            encrypt_head: HEADER_LEN + TAG_LEN,
            // Zero padding to the block boundary plus the length block.
            encrypt_tail: 2 * BLOCK_LEN - 1,
            decrypt_head: 0,
            decrypt_tail: 2 * BLOCK_LEN - 1,
        }
    }

    fn key_length(&self) -> usize {
        self.cipher.key_length() + self.gmac_cipher.key_length()
    }

    fn session_init(
        &self,
        secret: &[u8],
        initiator: bool,
        now: Instant,
        timing: &SessionTiming,
    ) -> Option<Box<dyn MethodSession>> {
        if secret.len() != self.key_length() {
            return None;
        }
        let split = self.cipher.key_length();
        let cipher_state = self.cipher.init(&secret[..split]);
        let gmac_state = self.gmac_cipher.init(&secret[split..]);

        // GHASH key: authentication-cipher keystream under the zero IV.
        let mut h = [0u8; BLOCK_LEN];
        let zero_iv = vec![0u8; self.gmac_cipher.iv_length()];
        if !gmac_state.crypt(&mut h, &ZERO_BLOCK, &zero_iv) {
            return None;
        }
        let ghash_state = self.ghash.init(&h);

        Some(Box::new(ComposedGmacSession {
            common: CommonSession::new(initiator, now, timing),
            key_valid_old: timing.key_valid_old,
            cipher_iv_len: self.cipher.iv_length(),
            gmac_iv_len: self.gmac_cipher.iv_length(),
            cipher: cipher_state,
            gmac_cipher: gmac_state,
            ghash: ghash_state,
        }))
    }
}

struct ComposedGmacSession {
    common: CommonSession,
    key_valid_old: std::time::Duration,
    cipher_iv_len: usize,
    gmac_iv_len: usize,
    cipher: Box<dyn CipherState>,
    gmac_cipher: Box<dyn CipherState>,
    ghash: Box<dyn MacState>,
}

/// GHASH length block: the plaintext length in bits, big-endian.
fn put_size(block: &mut [u8], len: usize) {
    block.fill(0);
    block[..8].copy_from_slice(&((len as u64) * 8).to_be_bytes());
}

fn xor_block(out: &mut [u8; BLOCK_LEN], other: &[u8; BLOCK_LEN]) {
    for (a, b) in out.iter_mut().zip(other.iter()) {
        *a ^= b;
    }
}

fn tags_equal(a: &[u8], b: &[u8]) -> bool {
    // Constant-time: fold the whole comparison before branching.
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    a.len() == b.len() && diff == 0
}

impl ComposedGmacSession {
    /// One keystream block of the authentication cipher for `nonce`; the
    /// tag mask that turns GHASH into GMAC.
    fn tag_mask(&self, nonce: u64) -> Option<[u8; BLOCK_LEN]> {
        let mut iv = vec![0u8; self.gmac_iv_len];
        expand_nonce(nonce, &mut iv);
        let mut mask = [0u8; BLOCK_LEN];
        if !self.gmac_cipher.crypt(&mut mask, &ZERO_BLOCK, &iv) {
            return None;
        }
        Some(mask)
    }

    /// Apply the data cipher in place under `nonce`.
    fn crypt_payload(&self, data: &mut [u8], nonce: u64) -> bool {
        if data.is_empty() {
            return true;
        }
        let mut iv = vec![0u8; self.cipher_iv_len];
        expand_nonce(nonce, &mut iv);
        let tmp = data.to_vec();
        self.cipher.crypt(data, &tmp, &iv)
    }

    /// GHASH over the buffer contents padded to the block boundary with
    /// the length block appended. Restores the buffer length afterwards.
    fn authenticate(&self, buffer: &mut Buffer) -> Result<[u8; BLOCK_LEN], MethodError> {
        let len = buffer.len();
        let pad = (BLOCK_LEN - len % BLOCK_LEN) % BLOCK_LEN;
        buffer.extend_tail(pad + BLOCK_LEN);
        {
            let data = buffer.as_mut_slice();
            let tail_start = len + pad;
            put_size(&mut data[tail_start..tail_start + BLOCK_LEN], len);
        }
        let digest = self
            .ghash
            .digest(buffer.as_slice())
            .ok_or(MethodError::CryptFailed)?;
        buffer.truncate(len);
        Ok(digest)
    }
}

impl MethodSession for ComposedGmacSession {
    fn is_valid(&self, now: Instant) -> bool {
        self.common.is_valid(now)
    }

    fn is_initiator(&self) -> bool {
        self.common.is_initiator()
    }

    fn want_refresh(&self, now: Instant) -> bool {
        self.common.want_refresh(now)
    }

    fn is_superseded(&self) -> bool {
        self.common.is_superseded()
    }

    fn set_superseded(&mut self, now: Instant) {
        self.common.set_superseded(now);
    }

    fn ready_to_drop(&self, now: Instant) -> bool {
        self.common.ready_to_drop(now, self.key_valid_old)
    }

    fn encrypt(&mut self, mut buffer: Buffer) -> Result<Buffer, MethodError> {
        let nonce = self
            .common
            .next_send_nonce()
            .ok_or(MethodError::NonceExhausted)?;

        if !self.crypt_payload(buffer.as_mut_slice(), nonce) {
            return Err(MethodError::CryptFailed);
        }

        let mut tag = self.authenticate(&mut buffer)?;
        let mask = self.tag_mask(nonce).ok_or(MethodError::CryptFailed)?;
        xor_block(&mut tag, &mask);

        buffer.push_head(&tag);
        put_header(&mut buffer, nonce, 0);
        Ok(buffer)
    }

    fn decrypt(&mut self, mut buffer: Buffer) -> Result<DecryptedPacket, MethodError> {
        if buffer.len() < HEADER_LEN + TAG_LEN {
            return Err(MethodError::TooShort);
        }
        let (nonce, flags) = parse_header(buffer.as_slice()).ok_or(MethodError::TooShort)?;
        if flags != 0 {
            return Err(MethodError::BadFlags);
        }

        match self.common.check_receive(nonce) {
            ReplayCheck::New | ReplayCheck::InWindow => {}
            ReplayCheck::Replayed | ReplayCheck::Rejected => return Err(MethodError::Replay),
        }

        buffer.pop_head(HEADER_LEN);
        let mut wire_tag = [0u8; TAG_LEN];
        wire_tag.copy_from_slice(&buffer.as_slice()[..TAG_LEN]);
        buffer.pop_head(TAG_LEN);

        let mut expected = self.authenticate(&mut buffer)?;
        let mask = self.tag_mask(nonce).ok_or(MethodError::CryptFailed)?;
        xor_block(&mut expected, &mask);

        if !tags_equal(&expected, &wire_tag) {
            return Err(MethodError::VerificationFailed);
        }

        if !self.crypt_payload(buffer.as_mut_slice(), nonce) {
            return Err(MethodError::CryptFailed);
        }

        let reordered = self.common.commit_receive(nonce);
        Ok(DecryptedPacket { payload: buffer, reordered })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::create_method;
    use std::time::Duration;

    fn timing() -> SessionTiming {
        SessionTiming {
            key_valid: Duration::from_secs(3600),
            key_valid_old: Duration::from_secs(60),
            key_refresh: Duration::from_secs(3300),
            key_refresh_splay: Duration::from_secs(0),
        }
    }

    fn session_pair(name: &str) -> (Box<dyn MethodSession>, Box<dyn MethodSession>) {
        let sel = ImplSelection::default();
        let provider = create_method(name, &sel).unwrap();
        let secret: Vec<u8> = (0..provider.key_length() as u8).collect();
        let now = Instant::now();
        let a = provider.session_init(&secret, true, now, &timing()).unwrap();
        let b = provider.session_init(&secret, false, now, &timing()).unwrap();
        (a, b)
    }

    fn encrypt_frame(
        session: &mut Box<dyn MethodSession>,
        provider_name: &str,
        frame: &[u8],
    ) -> Vec<u8> {
        let sel = ImplSelection::default();
        let provider = create_method(provider_name, &sel).unwrap();
        let space = provider.space();
        let buf = Buffer::from_slice(frame, space.encrypt_head, space.encrypt_tail);
        session.encrypt(buf).unwrap().into_vec()
    }

    fn decrypt_packet(
        session: &mut Box<dyn MethodSession>,
        provider_name: &str,
        packet: &[u8],
    ) -> Result<DecryptedPacket, MethodError> {
        let sel = ImplSelection::default();
        let provider = create_method(provider_name, &sel).unwrap();
        let space = provider.space();
        let buf = Buffer::from_slice(packet, space.decrypt_head, space.decrypt_tail);
        session.decrypt(buf)
    }

    #[test]
    fn test_roundtrip_all_methods() {
        for name in ["null+salsa20-gmac", "salsa20-gmac", "null+aes128-gmac", "aes128-gmac"] {
            let (mut a, mut b) = session_pair(name);
            let frame = b"\xff\xff\xff\xff\xff\xff\x02\x00\x00\x00\x00\x01\x08\x00";

            let packet = encrypt_frame(&mut a, name, frame);
            let out = decrypt_packet(&mut b, name, &packet).unwrap();
            assert_eq!(out.payload.as_slice(), frame, "method {}", name);
            assert!(!out.reordered);
        }
    }

    #[test]
    fn test_first_nonce_on_wire() {
        let name = "null+salsa20-gmac";
        let (mut a, mut b) = session_pair(name);
        let pa = encrypt_frame(&mut a, name, b"x");
        let pb = encrypt_frame(&mut b, name, b"x");
        // Initiator starts its sequence at 1, responder at 2.
        assert_eq!(&pa[..NONCE_LEN], &[1, 0, 0, 0, 0, 0]);
        assert_eq!(&pb[..NONCE_LEN], &[2, 0, 0, 0, 0, 0]);
        assert_eq!(pa[NONCE_LEN], 0);
    }

    #[test]
    fn test_replay_is_dropped() {
        let name = "null+salsa20-gmac";
        let (mut a, mut b) = session_pair(name);
        let packet = encrypt_frame(&mut a, name, b"hello");

        assert!(decrypt_packet(&mut b, name, &packet).is_ok());
        assert!(matches!(
            decrypt_packet(&mut b, name, &packet),
            Err(MethodError::Replay)
        ));
    }

    #[test]
    fn test_reordered_delivery() {
        let name = "null+salsa20-gmac";
        let (mut a, mut b) = session_pair(name);

        // Nonces 1, 3, 5, 7 in order, then 2... which is the responder
        // parity; use the initiator's own skipped packet instead.
        let p1 = encrypt_frame(&mut a, name, b"one");
        let p3 = encrypt_frame(&mut a, name, b"three");
        let p5 = encrypt_frame(&mut a, name, b"five");

        assert!(!decrypt_packet(&mut b, name, &p1).unwrap().reordered);
        assert!(!decrypt_packet(&mut b, name, &p5).unwrap().reordered);
        let late = decrypt_packet(&mut b, name, &p3).unwrap();
        assert!(late.reordered);
        assert_eq!(late.payload.as_slice(), b"three");
    }

    #[test]
    fn test_corrupted_byte_rejected_without_window_damage() {
        let name = "salsa20-gmac";
        let (mut a, mut b) = session_pair(name);
        let good = encrypt_frame(&mut a, name, b"payload");

        let mut bad = good.clone();
        *bad.last_mut().unwrap() ^= 0x01;
        assert!(matches!(
            decrypt_packet(&mut b, name, &bad),
            Err(MethodError::VerificationFailed)
        ));

        // The forged packet must not have consumed the nonce.
        assert!(decrypt_packet(&mut b, name, &good).is_ok());
    }

    #[test]
    fn test_keepalive_empty_payload() {
        let name = "null+salsa20-gmac";
        let (mut a, mut b) = session_pair(name);
        let packet = encrypt_frame(&mut a, name, b"");
        assert_eq!(packet.len(), HEADER_LEN + TAG_LEN);
        let out = decrypt_packet(&mut b, name, &packet).unwrap();
        assert!(out.payload.is_empty());
    }

    #[test]
    fn test_nonzero_flags_rejected() {
        let name = "null+salsa20-gmac";
        let (mut a, mut b) = session_pair(name);
        let mut packet = encrypt_frame(&mut a, name, b"data");
        packet[NONCE_LEN] = 0x80;
        assert!(matches!(
            decrypt_packet(&mut b, name, &packet),
            Err(MethodError::BadFlags)
        ));
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext_when_encrypted() {
        let name = "salsa20-gmac";
        let (mut a, _) = session_pair(name);
        let frame = b"plaintext frame bytes";
        let packet = encrypt_frame(&mut a, name, frame);
        let ct = &packet[HEADER_LEN + TAG_LEN..];
        assert_eq!(ct.len(), frame.len());
        assert_ne!(ct, frame);
    }
}
