//! SHA-256 helpers for content hashes and cache keys.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of `data`.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Incremental hasher fed chunk by chunk by [`super::StreamingIo::hash_file`].
#[derive(Default)]
pub(crate) struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub(crate) fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub(crate) fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}
