//! Salsa20 and Salsa20/12 stream ciphers

use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::{Salsa12, Salsa20};
use zeroize::Zeroizing;

use super::cipher::{Cipher, CipherState};

const KEY_LEN: usize = 32;
const IV_LEN: usize = 8;

pub struct Salsa20Cipher;
pub struct Salsa2012Cipher;

struct Salsa20State {
    key: Zeroizing<[u8; KEY_LEN]>,
}

struct Salsa2012State {
    key: Zeroizing<[u8; KEY_LEN]>,
}

fn apply<C: StreamCipher>(mut cipher: C, out: &mut [u8], input: &[u8]) -> bool {
    out.copy_from_slice(input);
    cipher.apply_keystream(out);
    true
}

impl CipherState for Salsa20State {
    fn crypt(&self, out: &mut [u8], input: &[u8], iv: &[u8]) -> bool {
        if out.len() != input.len() || iv.len() != IV_LEN {
            return false;
        }
        match Salsa20::new_from_slices(self.key.as_ref(), iv) {
            Ok(cipher) => apply(cipher, out, input),
            Err(_) => false,
        }
    }
}

impl CipherState for Salsa2012State {
    fn crypt(&self, out: &mut [u8], input: &[u8], iv: &[u8]) -> bool {
        if out.len() != input.len() || iv.len() != IV_LEN {
            return false;
        }
        match Salsa12::new_from_slices(self.key.as_ref(), iv) {
            Ok(cipher) => apply(cipher, out, input),
            Err(_) => false,
        }
    }
}

impl Cipher for Salsa20Cipher {
    fn key_length(&self) -> usize {
        KEY_LEN
    }

    fn iv_length(&self) -> usize {
        IV_LEN
    }

    fn init(&self, key: &[u8]) -> Box<dyn CipherState> {
        let mut k = Zeroizing::new([0u8; KEY_LEN]);
        k.copy_from_slice(key);
        Box::new(Salsa20State { key: k })
    }
}

impl Cipher for Salsa2012Cipher {
    fn key_length(&self) -> usize {
        KEY_LEN
    }

    fn iv_length(&self) -> usize {
        IV_LEN
    }

    fn init(&self, key: &[u8]) -> Box<dyn CipherState> {
        let mut k = Zeroizing::new([0u8; KEY_LEN]);
        k.copy_from_slice(key);
        Box::new(Salsa2012State { key: k })
    }
}
