//! Fragment hashing using BLAKE2b-256
//!
//! Fragment inventory verification reports a hex-encoded BLAKE2b-256 digest
//! per stored fragment.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::fmt;
use std::path::Path;

type Blake2b256 = Blake2b<U32>;

/// Read buffer size for file hashing
const HASH_BUF_SIZE: usize = 64 * 1024;

/// BLAKE2b-256 digest of a fragment (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FragmentHash([u8; 32]);

impl FragmentHash {
    /// Hash a byte slice
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for FragmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentHash({})", self.to_hex())
    }
}

/// Incremental hasher for large fragments
pub struct IncrementalHasher {
    hasher: Blake2b256,
}

impl IncrementalHasher {
    /// Create a new incremental hasher
    pub fn new() -> Self {
        Self {
            hasher: Blake2b256::new(),
        }
    }

    /// Update with more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and get the fragment hash
    pub fn finalize(self) -> FragmentHash {
        FragmentHash(self.hasher.finalize().into())
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a file on disk without loading it whole
pub async fn hash_file(path: &Path) -> std::io::Result<FragmentHash> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = IncrementalHasher::new();
    let mut buffer = vec![0u8; HASH_BUF_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}
