//! SHA-256 content digests.
//!
//! Both the manifest compiler and the verifier hash file content through
//! [`sha256_reader`], so a digest recorded at compile time is directly
//! comparable with one computed on a live host.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a SHA-256 digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Read buffer used while streaming content into the hasher.
const CHUNK_SIZE: usize = 64 * 1024;

/// A 256-bit content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest256([u8; DIGEST_SIZE]);

impl Digest256 {
    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Builds a digest from a byte slice, as stored in a database column.
    ///
    /// # Errors
    ///
    /// Returns [`DigestParseError::Length`] unless the slice is exactly
    /// [`DIGEST_SIZE`] bytes long.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, DigestParseError> {
        let raw: [u8; DIGEST_SIZE] = bytes
            .try_into()
            .map_err(|_| DigestParseError::Length { len: bytes.len() })?;
        Ok(Self(raw))
    }

    /// Digest of an in-memory buffer.
    #[must_use]
    pub fn of(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }
}

impl fmt::Display for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest256({self})")
    }
}

/// Errors from parsing a digest.
#[derive(Debug, Error, PartialEq)]
pub enum DigestParseError {
    /// Input was not valid hexadecimal.
    #[error("invalid hex digest: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Input decoded to the wrong number of bytes.
    #[error("digest must be {DIGEST_SIZE} bytes, got {len}")]
    Length {
        /// Decoded length.
        len: usize,
    },
}

impl FromStr for Digest256 {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::try_from_slice(&bytes)
    }
}

impl Serialize for Digest256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Streams `reader` to EOF and returns its digest and the number of bytes
/// consumed.
///
/// # Errors
///
/// Propagates any read error other than `Interrupted`.
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<(Digest256, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Digest256(hasher.finalize().into()), total))
}

/// Hashes the file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> io::Result<(Digest256, u64)> {
    sha256_reader(File::open(path)?)
}
