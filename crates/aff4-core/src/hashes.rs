//! Hash algorithm registry and streaming digests
//!
//! AFF4 tags every stored digest with an algorithm IRI. This module maps
//! between the IRIs (standard and legacy aliases), the short names used in
//! block-hash segment filenames, and the actual digest implementations.

use blake2::Blake2b512;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

/// A hash algorithm known to the AFF4 lexicon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    Blake2b,
    /// Derived datatype used for the per-volume block-map hash. Computed
    /// with SHA512.
    BlockMapSha512,
}

impl HashKind {
    /// The datatype IRI written to Turtle for digests of this algorithm.
    pub fn datatype_iri(&self) -> &'static str {
        match self {
            HashKind::Md5 => "http://aff4.org/Schema#MD5",
            HashKind::Sha1 => "http://aff4.org/Schema#SHA1",
            HashKind::Sha256 => "http://aff4.org/Schema#SHA256",
            HashKind::Sha512 => "http://aff4.org/Schema#SHA512",
            HashKind::Blake2b => "http://aff4.org/Schema#Blake2b",
            HashKind::BlockMapSha512 => "http://aff4.org/Schema#blockMapHashSHA512",
        }
    }

    /// Resolve a datatype IRI, accepting the pre-standard aliases.
    pub fn from_datatype_iri(iri: &str) -> Option<Self> {
        match iri {
            "http://aff4.org/Schema#MD5" | "http://afflib.org/2009/aff4#MD5" => {
                Some(HashKind::Md5)
            }
            "http://aff4.org/Schema#SHA1" | "http://afflib.org/2009/aff4#SHA1" => {
                Some(HashKind::Sha1)
            }
            "http://aff4.org/Schema#SHA256" | "http://afflib.org/2009/aff4#SHA256" => {
                Some(HashKind::Sha256)
            }
            "http://aff4.org/Schema#SHA512" | "http://afflib.org/2009/aff4#SHA512" => {
                Some(HashKind::Sha512)
            }
            "http://aff4.org/Schema#Blake2b"
            | "http://afflib.org/2009/aff4#Blake2b" => Some(HashKind::Blake2b),
            "http://aff4.org/Schema#blockMapHashSHA512"
            | "http://afflib.org/2009/aff4#blockMapHashSHA512" => {
                Some(HashKind::BlockMapSha512)
            }
            _ => None,
        }
    }

    /// Short name used in block-hash segment filenames.
    pub fn short_name(&self) -> &'static str {
        match self {
            HashKind::Md5 => "md5",
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
            HashKind::Sha512 => "sha512",
            HashKind::Blake2b => "blake2b",
            HashKind::BlockMapSha512 => "blockMapHashSHA512",
        }
    }

    pub fn from_short_name(name: &str) -> Option<Self> {
        match name {
            "md5" => Some(HashKind::Md5),
            "sha1" => Some(HashKind::Sha1),
            "sha256" => Some(HashKind::Sha256),
            "sha512" => Some(HashKind::Sha512),
            "blake2b" => Some(HashKind::Blake2b),
            "blockMapHashSHA512" => Some(HashKind::BlockMapSha512),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn digest_size(&self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
            HashKind::Sha512 | HashKind::BlockMapSha512 => 64,
            HashKind::Blake2b => 64,
        }
    }

    /// Fixed precedence used when folding several block-hash algorithms into
    /// one block-map hash.
    pub fn ordering(&self) -> u32 {
        match self {
            HashKind::Md5 => 1,
            HashKind::Sha1 => 2,
            HashKind::Sha256 => 3,
            HashKind::Sha512 => 4,
            HashKind::Blake2b => 5,
            HashKind::BlockMapSha512 => 6,
        }
    }
}

enum Inner {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
    Blake2b(Box<Blake2b512>),
}

/// A streaming digest for one algorithm.
pub struct HashSink {
    kind: HashKind,
    inner: Inner,
}

impl HashSink {
    pub fn new(kind: HashKind) -> Self {
        let inner = match kind {
            HashKind::Md5 => Inner::Md5(Md5::new()),
            HashKind::Sha1 => Inner::Sha1(Sha1::new()),
            HashKind::Sha256 => Inner::Sha256(Sha256::new()),
            HashKind::Sha512 | HashKind::BlockMapSha512 => Inner::Sha512(Sha512::new()),
            HashKind::Blake2b => Inner::Blake2b(Box::new(Blake2b512::new())),
        };
        Self { kind, inner }
    }

    pub fn kind(&self) -> HashKind {
        self.kind
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Md5(h) => h.update(data),
            Inner::Sha1(h) => h.update(data),
            Inner::Sha256(h) => h.update(data),
            Inner::Sha512(h) => h.update(data),
            Inner::Blake2b(h) => h.update(data),
        }
    }

    /// Consume the sink and return the raw digest.
    pub fn finalize(self) -> Vec<u8> {
        match self.inner {
            Inner::Md5(h) => h.finalize().to_vec(),
            Inner::Sha1(h) => h.finalize().to_vec(),
            Inner::Sha256(h) => h.finalize().to_vec(),
            Inner::Sha512(h) => h.finalize().to_vec(),
            Inner::Blake2b(h) => h.finalize().to_vec(),
        }
    }

    /// Consume the sink and return the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }
}

/// One-shot digest of a byte slice.
pub fn digest_bytes(kind: HashKind, data: &[u8]) -> Vec<u8> {
    let mut sink = HashSink::new(kind);
    sink.update(data);
    sink.finalize()
}

/// One-shot hex digest of a byte slice.
pub fn hex_digest_bytes(kind: HashKind, data: &[u8]) -> String {
    hex::encode(digest_bytes(kind, data))
}

/// Decode a stored hex digest, rejecting malformed values.
pub fn decode_digest(kind: HashKind, value: &str) -> Result<Vec<u8>> {
    let raw = hex::decode(value)
        .map_err(|e| Error::format(format!("bad {} digest: {}", kind.short_name(), e)))?;
    if raw.len() != kind.digest_size() {
        return Err(Error::format(format!(
            "{} digest must be {} bytes, got {}",
            kind.short_name(),
            kind.digest_size(),
            raw.len()
        )));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_digest() {
        // MD5("Hello, World!") = 65a8e27d8879283831b664bd8b7f0ad4
        assert_eq!(
            hex_digest_bytes(HashKind::Md5, b"Hello, World!"),
            "65a8e27d8879283831b664bd8b7f0ad4"
        );
    }

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            hex_digest_bytes(HashKind::Sha256, b"Hello, World!"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_sha1_incremental() {
        let mut sink = HashSink::new(HashKind::Sha1);
        sink.update(b"Hello, ");
        sink.update(b"World!");
        assert_eq!(
            sink.finalize_hex(),
            "0a0a9f2a6772942557ab5355d76af442f8f65e01"
        );
    }

    #[test]
    fn test_iri_roundtrip() {
        for kind in [
            HashKind::Md5,
            HashKind::Sha1,
            HashKind::Sha256,
            HashKind::Sha512,
            HashKind::Blake2b,
            HashKind::BlockMapSha512,
        ] {
            assert_eq!(HashKind::from_datatype_iri(kind.datatype_iri()), Some(kind));
            assert_eq!(HashKind::from_short_name(kind.short_name()), Some(kind));
        }
    }

    #[test]
    fn test_legacy_alias() {
        assert_eq!(
            HashKind::from_datatype_iri("http://afflib.org/2009/aff4#SHA1"),
            Some(HashKind::Sha1)
        );
    }

    #[test]
    fn test_ordering_precedence() {
        assert!(HashKind::Md5.ordering() < HashKind::Sha1.ordering());
        assert!(HashKind::Sha512.ordering() < HashKind::Blake2b.ordering());
    }

    #[test]
    fn test_decode_digest_length_check() {
        assert!(decode_digest(HashKind::Md5, "aabb").is_err());
        assert!(decode_digest(HashKind::Md5, "65a8e27d8879283831b664bd8b7f0ad4").is_ok());
        assert!(decode_digest(HashKind::Md5, "not-hex").is_err());
    }

    #[test]
    fn test_blockmap_uses_sha512() {
        assert_eq!(
            hex_digest_bytes(HashKind::BlockMapSha512, b"x"),
            hex_digest_bytes(HashKind::Sha512, b"x")
        );
    }
}
