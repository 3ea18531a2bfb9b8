//! Curve25519 key exchange with mutual authentication
//!
//! Three messages (Init, Response, Finish). Each side contributes its
//! long-term identity key and a per-handshake ephemeral; the session
//! secret is derived by hashing the four Diffie-Hellman combinations of
//! those keys over the public-key transcript, so neither side can complete
//! the exchange without both its keys. Explicit HMAC confirmation tags in
//! Response and Finish prove key possession before any session is
//! installed.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hkdf::Hkdf;
use hmac::{Hmac, Mac as _};
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::types::PublicKeyBytes;

type HmacSha256 = Hmac<Sha256>;

/// Key-exchange protocol name carried in handshake packets.
pub const PROTOCOL_NAME: &str = "ec25519-fhmqvc";

/// Handshake attempts before giving up and backing off.
pub const MAX_HANDSHAKE_TRIES: u32 = 5;

/// Length of a confirmation tag on the wire.
pub const CONFIRM_TAG_LEN: usize = 32;

const KDF_INFO: &[u8] = b"ec25519-fhmqvc session key expansion";

// =============================================================================
// KEYS
// =============================================================================

/// Long-term identity keypair.
pub struct IdentityKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKey {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        IdentityKey { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        IdentityKey { secret, public }
    }

    pub fn public_bytes(&self) -> PublicKeyBytes {
        *self.public.as_bytes()
    }
}

/// Per-handshake ephemeral keypair.
///
/// Held as a `StaticSecret` because the derivation performs two separate
/// DH operations with it.
pub struct EphemeralKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKey {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        EphemeralKey { secret, public }
    }

    pub fn public_bytes(&self) -> PublicKeyBytes {
        *self.public.as_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

// =============================================================================
// KEY DERIVATION
// =============================================================================

/// Keys produced by a completed exchange: a confirmation-tag key and the
/// session key material handed to the negotiated method.
pub struct SessionKeys {
    confirm_key: Zeroizing<[u8; 32]>,
    material: Zeroizing<Vec<u8>>,
}

impl SessionKeys {
    pub fn material(&self) -> &[u8] {
        &self.material
    }
}

/// Run the combiner from one side's view.
///
/// `peer_static` / `peer_eph` are the remote public keys. `key_len` is the
/// method key length to derive. Returns None if any DH result is
/// non-contributory (low-order remote point).
pub fn derive_keys(
    role: Role,
    our_identity: &IdentityKey,
    our_eph: &EphemeralKey,
    peer_static: &PublicKeyBytes,
    peer_eph: &PublicKeyBytes,
    key_len: usize,
) -> Option<SessionKeys> {
    let peer_static_pk = PublicKey::from(*peer_static);
    let peer_eph_pk = PublicKey::from(*peer_eph);

    // Canonical order: (eph_i·eph_r, eph_i·stat_r, stat_i·eph_r,
    // stat_i·stat_r). Which local key touches which remote key depends on
    // the side computing it.
    let (dh1, dh2, dh3, dh4) = match role {
        Role::Initiator => (
            our_eph.secret.diffie_hellman(&peer_eph_pk),
            our_eph.secret.diffie_hellman(&peer_static_pk),
            our_identity.secret.diffie_hellman(&peer_eph_pk),
            our_identity.secret.diffie_hellman(&peer_static_pk),
        ),
        Role::Responder => (
            our_eph.secret.diffie_hellman(&peer_eph_pk),
            our_identity.secret.diffie_hellman(&peer_eph_pk),
            our_eph.secret.diffie_hellman(&peer_static_pk),
            our_identity.secret.diffie_hellman(&peer_static_pk),
        ),
    };

    for dh in [&dh1, &dh2, &dh3, &dh4] {
        if !dh.was_contributory() {
            return None;
        }
    }

    let transcript = match role {
        Role::Initiator => transcript(
            &our_identity.public_bytes(),
            &our_eph.public_bytes(),
            peer_static,
            peer_eph,
        ),
        Role::Responder => transcript(
            peer_static,
            peer_eph,
            &our_identity.public_bytes(),
            &our_eph.public_bytes(),
        ),
    };

    let mut ikm = Zeroizing::new([0u8; 128]);
    ikm[..32].copy_from_slice(dh1.as_bytes());
    ikm[32..64].copy_from_slice(dh2.as_bytes());
    ikm[64..96].copy_from_slice(dh3.as_bytes());
    ikm[96..].copy_from_slice(dh4.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&transcript), ikm.as_ref());
    let mut okm = Zeroizing::new(vec![0u8; 32 + key_len]);
    hk.expand(KDF_INFO, &mut okm).ok()?;

    let mut confirm_key = Zeroizing::new([0u8; 32]);
    confirm_key.copy_from_slice(&okm[..32]);
    let material = Zeroizing::new(okm[32..].to_vec());

    Some(SessionKeys { confirm_key, material })
}

/// Transcript of all public keys, initiator first.
fn transcript(
    initiator_static: &PublicKeyBytes,
    initiator_eph: &PublicKeyBytes,
    responder_static: &PublicKeyBytes,
    responder_eph: &PublicKeyBytes,
) -> [u8; 128] {
    let mut t = [0u8; 128];
    t[..32].copy_from_slice(initiator_static);
    t[32..64].copy_from_slice(initiator_eph);
    t[64..96].copy_from_slice(responder_static);
    t[96..].copy_from_slice(responder_eph);
    t
}

/// Confirmation tag the given role sends: HMAC over a role byte, so the
/// two directions can never be confused.
pub fn confirmation_tag(keys: &SessionKeys, role: Role) -> [u8; CONFIRM_TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(keys.confirm_key.as_ref())
        .expect("HMAC accepts any key length");
    mac.update(&[match role {
        Role::Initiator => 1,
        Role::Responder => 2,
    }]);
    let tag = mac.finalize().into_bytes();
    tag.into()
}

/// Verify a received confirmation tag in constant time.
pub fn verify_confirmation_tag(keys: &SessionKeys, role: Role, tag: &[u8]) -> bool {
    let mut mac = match HmacSha256::new_from_slice(keys.confirm_key.as_ref()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(&[match role {
        Role::Initiator => 1,
        Role::Responder => 2,
    }]);
    mac.verify_slice(tag).is_ok()
}

// =============================================================================
// ATTEMPT STATE
// =============================================================================

/// Outbound handshake in flight: we sent Init and wait for a Response.
pub struct InitiatedHandshake {
    pub eph: EphemeralKey,
    pub remote: SocketAddr,
    /// Init packets sent so far.
    pub tries: u32,
    pub next_retry: Instant,
}

impl InitiatedHandshake {
    pub fn new(remote: SocketAddr, now: Instant, retry_interval: Duration) -> Self {
        InitiatedHandshake {
            eph: EphemeralKey::generate(),
            remote,
            tries: 1,
            next_retry: now + retry_interval,
        }
    }

    /// Whether another Init should go out now; records the try.
    pub fn should_retry(&mut self, now: Instant, retry_interval: Duration) -> bool {
        if self.tries >= MAX_HANDSHAKE_TRIES || now < self.next_retry {
            return false;
        }
        self.tries += 1;
        self.next_retry = now + retry_interval;
        true
    }

    pub fn exhausted(&self) -> bool {
        self.tries >= MAX_HANDSHAKE_TRIES
    }
}

/// Inbound handshake in flight: we answered an Init with a Response and
/// wait for the Finish carrying our ephemeral back.
pub struct AcceptedHandshake {
    pub eph: EphemeralKey,
    pub peer_eph: PublicKeyBytes,
    pub remote: SocketAddr,
    pub started: Instant,
}

impl AcceptedHandshake {
    pub fn expired(&self, now: Instant, timeout: Duration) -> bool {
        now >= self.started + timeout
    }
}
