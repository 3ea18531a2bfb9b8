//! Cipher and MAC primitives behind named providers
//!
//! Every primitive is registered under an algorithm name plus an
//! implementation name, so hardware-accelerated variants can sit next to
//! the portable ones. Configuration may pin an implementation per
//! algorithm; requesting an implementation that is not built in is a fatal
//! configuration error.

pub mod cipher;
pub mod mac;

mod aes128_ctr;
mod ghash;
mod null;
mod salsa20;

use std::collections::HashMap;

use thiserror::Error;

pub use cipher::{Cipher, CipherState};
pub use mac::{Mac, MacState};

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("unknown cipher `{0}`")]
    UnknownCipher(String),
    #[error("unknown MAC `{0}`")]
    UnknownMac(String),
    #[error("implementation `{impl_name}` is not supported for `{algo}`")]
    UnknownImpl { algo: String, impl_name: String },
}

/// Implementations of one algorithm, first entry is the default.
struct CipherEntry {
    name: &'static str,
    impls: &'static [(&'static str, &'static (dyn Cipher + Sync))],
}

struct MacEntry {
    name: &'static str,
    impls: &'static [(&'static str, &'static (dyn Mac + Sync))],
}

static CIPHERS: &[CipherEntry] = &[
    CipherEntry { name: "null", impls: &[("builtin", &null::NullCipher)] },
    CipherEntry { name: "salsa20", impls: &[("builtin", &salsa20::Salsa20Cipher)] },
    CipherEntry { name: "salsa2012", impls: &[("builtin", &salsa20::Salsa2012Cipher)] },
    CipherEntry { name: "aes128-ctr", impls: &[("builtin", &aes128_ctr::Aes128CtrCipher)] },
];

static MACS: &[MacEntry] = &[MacEntry { name: "ghash", impls: &[("builtin", &ghash::GhashMac)] }];

/// Per-algorithm implementation selection from the configuration.
///
/// Algorithms not present in the map use their default implementation.
#[derive(Debug, Clone, Default)]
pub struct ImplSelection {
    pub ciphers: HashMap<String, String>,
    pub macs: HashMap<String, String>,
}

impl ImplSelection {
    /// Validate every selection against the registry. Called once at
    /// startup, before the event loop.
    pub fn validate(&self) -> Result<(), CryptoError> {
        for (algo, impl_name) in &self.ciphers {
            let entry = CIPHERS
                .iter()
                .find(|e| e.name == algo)
                .ok_or_else(|| CryptoError::UnknownCipher(algo.clone()))?;
            if !entry.impls.iter().any(|(n, _)| n == impl_name) {
                return Err(CryptoError::UnknownImpl {
                    algo: algo.clone(),
                    impl_name: impl_name.clone(),
                });
            }
        }
        for (algo, impl_name) in &self.macs {
            let entry = MACS
                .iter()
                .find(|e| e.name == algo)
                .ok_or_else(|| CryptoError::UnknownMac(algo.clone()))?;
            if !entry.impls.iter().any(|(n, _)| n == impl_name) {
                return Err(CryptoError::UnknownImpl {
                    algo: algo.clone(),
                    impl_name: impl_name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Look up a cipher by algorithm name, honouring the configured
/// implementation selection.
pub fn cipher_get(name: &str, selection: &ImplSelection) -> Option<&'static (dyn Cipher + Sync)> {
    let entry = CIPHERS.iter().find(|e| e.name == name)?;
    match selection.ciphers.get(name) {
        Some(impl_name) => entry
            .impls
            .iter()
            .find(|(n, _)| n == impl_name)
            .map(|(_, c)| *c),
        None => entry.impls.first().map(|(_, c)| *c),
    }
}

/// Look up a MAC by algorithm name.
pub fn mac_get(name: &str, selection: &ImplSelection) -> Option<&'static (dyn Mac + Sync)> {
    let entry = MACS.iter().find(|e| e.name == name)?;
    match selection.macs.get(name) {
        Some(impl_name) => entry
            .impls
            .iter()
            .find(|(n, _)| n == impl_name)
            .map(|(_, m)| *m),
        None => entry.impls.first().map(|(_, m)| *m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let sel = ImplSelection::default();
        assert!(cipher_get("null", &sel).is_some());
        assert!(cipher_get("salsa20", &sel).is_some());
        assert!(cipher_get("aes128-ctr", &sel).is_some());
        assert!(cipher_get("rot13", &sel).is_none());
        assert!(mac_get("ghash", &sel).is_some());
    }

    #[test]
    fn test_impl_selection_validation() {
        let mut sel = ImplSelection::default();
        sel.ciphers.insert("salsa20".into(), "builtin".into());
        assert!(sel.validate().is_ok());

        sel.ciphers.insert("salsa20".into(), "asm-avx2".into());
        assert!(matches!(sel.validate(), Err(CryptoError::UnknownImpl { .. })));

        let mut sel = ImplSelection::default();
        sel.macs.insert("hmac-md5".into(), "builtin".into());
        assert!(matches!(sel.validate(), Err(CryptoError::UnknownMac(_))));
    }

    #[test]
    fn test_salsa20_keystream_roundtrip() {
        let sel = ImplSelection::default();
        let cipher = cipher_get("salsa20", &sel).unwrap();
        assert_eq!(cipher.key_length(), 32);
        assert_eq!(cipher.iv_length(), 8);

        let state = cipher.init(&[7u8; 32]);
        let iv = [1u8; 8];
        let plain = b"attack at dawn";
        let mut ct = vec![0u8; plain.len()];
        assert!(state.crypt(&mut ct, plain, &iv));
        assert_ne!(&ct[..], plain);

        let mut back = vec![0u8; plain.len()];
        assert!(state.crypt(&mut back, &ct, &iv));
        assert_eq!(&back[..], plain);
    }

    #[test]
    fn test_null_cipher_is_identity() {
        let sel = ImplSelection::default();
        let cipher = cipher_get("null", &sel).unwrap();
        let state = cipher.init(&[]);
        let mut out = [0u8; 4];
        assert!(state.crypt(&mut out, b"data", &[]));
        assert_eq!(&out, b"data");
    }
}
