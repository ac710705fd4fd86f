//! Content digests that stay stable across toolchains.
//!
//! Persisted fingerprints and RNG seeds feed explicit little-endian bytes into
//! SHA-256 and keep the first eight digest bytes. `std`'s `DefaultHasher` is
//! not used for these because its algorithm may change between releases.

use sha2::{Digest, Sha256};

#[derive(Clone, Default)]
pub struct StableDigest {
    inner: Sha256,
}

impl StableDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    /// Length-prefixed, so `("a", "bc")` and `("ab", "c")` differ.
    pub fn str(&mut self, value: &str) -> &mut Self {
        self.u64(value.len() as u64);
        self.inner.update(value.as_bytes());
        self
    }

    pub fn f64s(&mut self, values: &[f64]) -> &mut Self {
        self.u64(values.len() as u64);
        for v in values {
            self.u64(v.to_bits());
        }
        self
    }

    pub fn finish(&self) -> u64 {
        let digest = self.inner.clone().finalize();
        digest[..8]
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }
}
