//! Method layer: composes cipher and MAC primitives into the
//! encrypt/decrypt construction a session runs
//!
//! A method is selected by name from the configured list during the
//! handshake. Providers are process-lived; per-session state is owned by
//! the peer that negotiated it.

pub mod common;
pub mod composed_gmac;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::buffer::Buffer;
use crate::crypto::ImplSelection;
use common::SessionTiming;

#[derive(Error, Debug)]
pub enum MethodError {
    #[error("send nonce sequence exhausted")]
    NonceExhausted,
    #[error("session expired")]
    SessionExpired,
    #[error("packet too short")]
    TooShort,
    #[error("nonzero header flags")]
    BadFlags,
    #[error("replayed or out-of-window nonce")]
    Replay,
    #[error("authentication tag mismatch")]
    VerificationFailed,
    #[error("cipher failure")]
    CryptFailed,
}

/// Result of a successful decrypt.
pub struct DecryptedPacket {
    pub payload: Buffer,
    /// The packet arrived behind one already delivered.
    pub reordered: bool,
}

/// Space a packet buffer must reserve for this method, fixed per provider.
#[derive(Debug, Clone, Copy)]
pub struct MethodSpace {
    pub max_overhead: usize,
    pub encrypt_head: usize,
    pub encrypt_tail: usize,
    pub decrypt_head: usize,
    pub decrypt_tail: usize,
}

/// A named method, instantiated from the configuration.
pub trait MethodProvider: Send + Sync {
    /// The configured name this provider was created under.
    fn name(&self) -> &str;

    /// Buffer space contract.
    fn space(&self) -> MethodSpace;

    /// Bytes of key material a session consumes.
    fn key_length(&self) -> usize;

    /// Create a session from `secret` (must be `key_length` bytes).
    /// Returns None if the primitives reject the key material.
    fn session_init(
        &self,
        secret: &[u8],
        initiator: bool,
        now: Instant,
        timing: &SessionTiming,
    ) -> Option<Box<dyn MethodSession>>;
}

/// Cryptographic state for one session between two peers.
pub trait MethodSession: Send + Sync {
    fn is_valid(&self, now: Instant) -> bool;
    fn is_initiator(&self) -> bool;
    fn want_refresh(&self, now: Instant) -> bool;
    fn is_superseded(&self) -> bool;

    /// Stop encrypting under this session; decrypts continue for the
    /// configured grace period.
    fn set_superseded(&mut self, now: Instant);
    fn ready_to_drop(&self, now: Instant) -> bool;

    /// Encrypt and authenticate `buffer` in place. The buffer must have
    /// been allocated with this method's encrypt head/tail space. An empty
    /// buffer produces a keepalive packet.
    fn encrypt(&mut self, buffer: Buffer) -> Result<Buffer, MethodError>;

    /// Verify and decrypt a data packet (leading type byte already
    /// stripped). The replay window is consulted before and committed
    /// after tag verification, so forged packets leave no trace.
    fn decrypt(&mut self, buffer: Buffer) -> Result<DecryptedPacket, MethodError>;
}

#[derive(Error, Debug)]
pub enum MethodCreateError {
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
}

/// Instantiate a method by its configured name.
pub fn create_method(
    name: &str,
    selection: &ImplSelection,
) -> Result<Arc<dyn MethodProvider>, MethodCreateError> {
    if let Some(provider) = composed_gmac::create_by_name(name, selection) {
        return Ok(Arc::new(provider));
    }
    Err(MethodCreateError::UnknownMethod(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_by_name() {
        let sel = ImplSelection::default();
        assert!(create_method("null+salsa20-gmac", &sel).is_ok());
        assert!(create_method("salsa20-gmac", &sel).is_ok());
        assert!(create_method("null+aes128-gmac", &sel).is_ok());
        assert!(create_method("aes128-gmac", &sel).is_ok());
        assert!(create_method("null", &sel).is_err());
        assert!(create_method("xtea+salsa20-gmac", &sel).is_err());
    }

    #[test]
    fn test_key_length_is_sum_of_parts() {
        let sel = ImplSelection::default();
        // null (0) + salsa20 (32)
        let m = create_method("null+salsa20-gmac", &sel).unwrap();
        assert_eq!(m.key_length(), 32);
        // salsa20 (32) + salsa20 (32)
        let m = create_method("salsa20-gmac", &sel).unwrap();
        assert_eq!(m.key_length(), 64);
        // null (0) + aes128-ctr (16)
        let m = create_method("null+aes128-gmac", &sel).unwrap();
        assert_eq!(m.key_length(), 16);
    }
}
