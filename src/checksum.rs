//! SHA-256 hashing of byte streams and files.
//!
//! Model downloads and integrity checks compare lowercase hex digests.
//! Files are read in 64 KiB chunks so multi-gigabyte model weights never
//! land in memory at once.

use crate::error::{LyraError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Incremental SHA-256 hasher for streamed byte sources.
pub struct Sha256Stream {
    inner: Sha256,
}

impl Sha256Stream {
    pub fn new() -> Self {
        Self { inner: Sha256::new() }
    }

    /// Feed the next chunk of bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Consume the hasher and return the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        let digest = self.inner.finalize();
        format!("{digest:x}")
    }
}

impl Default for Sha256Stream {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a complete in-memory buffer.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut stream = Sha256Stream::new();
    stream.update(bytes);
    stream.finalize_hex()
}

/// Compute the SHA-256 hex digest of a file's contents.
///
/// # Errors
///
/// Returns a storage error if the file cannot be opened or read.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| LyraError::from_io(format!("opening {} for hashing", path.display()), &e))?;
    let mut stream = Sha256Stream::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| LyraError::from_io(format!("reading {} for hashing", path.display()), &e))?;
        if n == 0 {
            break;
        }
        stream.update(&buf[..n]);
    }
    Ok(stream.finalize_hex())
}

/// Check that a string is a well-formed lowercase SHA-256 hex digest.
pub fn is_valid_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
