//! MAC provider contract

/// Authentication tag length shared by all MACs here.
pub const TAG_LEN: usize = 16;

/// Keyed MAC state, created once per session.
pub trait MacState: Send + Sync {
    /// Digest `data` into a 16-byte tag.
    ///
    /// `data` must be a whole number of 16-byte blocks (callers pad).
    /// Returns None if it is not.
    fn digest(&self, data: &[u8]) -> Option<[u8; TAG_LEN]>;
}

/// A named MAC algorithm.
pub trait Mac {
    /// Key length in bytes.
    fn key_length(&self) -> usize;

    /// Create session state from `key` (must be `key_length` bytes).
    fn init(&self, key: &[u8]) -> Box<dyn MacState>;
}
