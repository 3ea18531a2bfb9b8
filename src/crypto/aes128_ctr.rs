//! AES-128 in counter mode

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use zeroize::Zeroizing;

use super::cipher::{Cipher, CipherState};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const KEY_LEN: usize = 16;
const IV_LEN: usize = 16;

pub struct Aes128CtrCipher;

struct Aes128CtrState {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl CipherState for Aes128CtrState {
    fn crypt(&self, out: &mut [u8], input: &[u8], iv: &[u8]) -> bool {
        if out.len() != input.len() || iv.len() != IV_LEN {
            return false;
        }
        let mut cipher = match Aes128Ctr::new_from_slices(self.key.as_ref(), iv) {
            Ok(c) => c,
            Err(_) => return false,
        };
        out.copy_from_slice(input);
        cipher.apply_keystream(out);
        true
    }
}

impl Cipher for Aes128CtrCipher {
    fn key_length(&self) -> usize {
        KEY_LEN
    }

    fn iv_length(&self) -> usize {
        IV_LEN
    }

    fn init(&self, key: &[u8]) -> Box<dyn CipherState> {
        let mut k = Zeroizing::new([0u8; KEY_LEN]);
        k.copy_from_slice(key);
        Box::new(Aes128CtrState { key: k })
    }
}
