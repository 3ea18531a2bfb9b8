//! Packet buffers with reserved head and tail space
//!
//! Encrypt and decrypt transform packets in place and prepend headers
//! without copying the payload around. A `Buffer` owns one allocation with
//! slack on both sides; the slack sizes are negotiated from the selected
//! method's declared space requirements before the packet is read in.

/// Owned byte buffer with head- and tail-space slack.
///
/// Invariant: `0 <= head <= head + len <= capacity`.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    len: usize,
}

impl Buffer {
    /// Allocate a buffer of `len` zeroed bytes with the given slack on
    /// either side.
    pub fn alloc(len: usize, head_space: usize, tail_space: usize) -> Self {
        Buffer {
            data: vec![0u8; head_space + len + tail_space],
            head: head_space,
            len,
        }
    }

    /// Wrap existing payload bytes, copying them into a fresh allocation
    /// with the requested slack.
    pub fn from_slice(payload: &[u8], head_space: usize, tail_space: usize) -> Self {
        let mut buf = Self::alloc(payload.len(), head_space, tail_space);
        buf.as_mut_slice().copy_from_slice(payload);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head_space(&self) -> usize {
        self.head
    }

    pub fn tail_space(&self) -> usize {
        self.data.len() - self.head - self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..self.head + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.head + self.len]
    }

    /// Prepend `bytes`, consuming head space.
    ///
    /// Panics if the head space was not reserved; space requirements are
    /// fixed per method, so running out is a programming error, not input
    /// dependent.
    pub fn push_head(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.head, "buffer head space exhausted");
        self.head -= bytes.len();
        self.len += bytes.len();
        self.data[self.head..self.head + bytes.len()].copy_from_slice(bytes);
    }

    /// Drop `n` bytes from the front, returning them to head space.
    pub fn pop_head(&mut self, n: usize) {
        assert!(n <= self.len, "pop_head beyond buffer length");
        self.head += n;
        self.len -= n;
    }

    /// Extend the buffer by `n` zeroed bytes of tail space.
    pub fn extend_tail(&mut self, n: usize) {
        assert!(n <= self.tail_space(), "buffer tail space exhausted");
        let start = self.head + self.len;
        self.data[start..start + n].fill(0);
        self.len += n;
    }

    /// Shrink the buffer to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.len, "truncate beyond buffer length");
        self.len = len;
    }

    /// Take the payload out as a plain vector.
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.head == 0 {
            self.data.truncate(self.len);
            self.data
        } else {
            self.as_slice().to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_push_pop() {
        let mut buf = Buffer::from_slice(b"payload", 8, 4);
        assert_eq!(buf.as_slice(), b"payload");

        buf.push_head(b"hdr:");
        assert_eq!(buf.as_slice(), b"hdr:payload");
        assert_eq!(buf.head_space(), 4);

        buf.pop_head(4);
        assert_eq!(buf.as_slice(), b"payload");
    }

    #[test]
    fn test_tail_extend_truncate() {
        let mut buf = Buffer::from_slice(b"abc", 0, 5);
        buf.extend_tail(5);
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf.as_slice()[3..], &[0, 0, 0, 0, 0]);

        buf.truncate(3);
        assert_eq!(buf.as_slice(), b"abc");
        assert_eq!(buf.tail_space(), 5);
    }

    #[test]
    #[should_panic(expected = "head space exhausted")]
    fn test_head_overflow_panics() {
        let mut buf = Buffer::from_slice(b"x", 2, 0);
        buf.push_head(b"abc");
    }

    #[test]
    fn test_into_vec_with_offset() {
        let mut buf = Buffer::from_slice(b"xxpayload", 0, 0);
        buf.pop_head(2);
        assert_eq!(buf.into_vec(), b"payload");
    }
}
