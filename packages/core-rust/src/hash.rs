//! 64-bit content hash for end-to-end corruption detection in file transfers.
//!
//! The sender feeds every chunk it puts on the wire into a [`ContentHasher`]
//! and reports the digest in the EOF call; the receiver hashes what it got
//! and compares. BLAKE3 is used for speed; only the first 8 bytes of the
//! digest are kept, read little-endian.

/// Incremental hasher over the bytes of one transfer.
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
    len: u64,
}

impl ContentHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
        self.len += bytes.len() as u64;
    }

    /// Number of bytes hashed so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn finish(&self) -> i64 {
        let digest = self.inner.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        i64::from_le_bytes(head)
    }
}

/// Hashes a complete buffer in one call.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> i64 {
    let mut hasher = ContentHasher::new();
    hasher.update(bytes);
    hasher.finish()
}
