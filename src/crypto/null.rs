//! Null cipher: identity transform for authenticated-only methods

use super::cipher::{Cipher, CipherState};

pub struct NullCipher;

struct NullState;

impl CipherState for NullState {
    fn crypt(&self, out: &mut [u8], input: &[u8], _iv: &[u8]) -> bool {
        if out.len() != input.len() {
            return false;
        }
        out.copy_from_slice(input);
        true
    }
}

impl Cipher for NullCipher {
    fn key_length(&self) -> usize {
        0
    }

    fn iv_length(&self) -> usize {
        0
    }

    fn init(&self, _key: &[u8]) -> Box<dyn CipherState> {
        Box::new(NullState)
    }
}
