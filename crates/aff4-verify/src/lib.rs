//! # AFF4 Verify
//!
//! The layered hash validation pipeline: per-chunk block hashes, map
//! segment hashes, per-volume block-map hashes and the top-level image
//! hash, plus the linear (flat) image hash. `BlockHashWriter` produces the
//! same scheme for containers written by this library.

pub mod block;
pub mod linear;
pub mod writer;

use aff4_core::{Error, Result, Urn};

pub use block::Validator;
pub use linear::LinearHasher;
pub use writer::BlockHashWriter;

/// Receives validation outcomes. The default listener raises on any
/// mismatch; replacements may collect diagnostics and continue.
pub trait ValidationListener {
    fn on_valid_block_hash(&mut self, _digest: &str) {}

    fn on_invalid_block_hash(
        &mut self,
        computed: &str,
        stored: &str,
        stream: &Urn,
        offset: u64,
    ) -> Result<()> {
        let _ = (computed, stored);
        Err(Error::integrity(format!(
            "invalid block hash comparison for stream {} at offset {}",
            stream, offset
        )))
    }

    fn on_valid_hash(&mut self, kind: &str, digest: &str, subject: &Urn) {
        tracing::info!("Validation of {} {} succeeded. Hash = {}", subject, kind, digest);
    }

    fn on_invalid_hash(
        &mut self,
        kind: &str,
        stored: &str,
        computed: &str,
        subject: &Urn,
    ) -> Result<()> {
        let _ = (stored, computed);
        Err(Error::integrity(format!(
            "invalid {} comparison for stream {}",
            kind, subject
        )))
    }
}

/// The default listener: logs successes, raises on the first mismatch.
#[derive(Debug, Default)]
pub struct StrictListener;

impl ValidationListener for StrictListener {}

/// Collects every outcome instead of raising, for diagnostics.
#[derive(Debug, Default)]
pub struct CollectingListener {
    pub valid: Vec<(String, String)>,
    pub invalid: Vec<(String, String, String, String)>,
    pub invalid_blocks: Vec<(String, u64)>,
}

impl ValidationListener for CollectingListener {
    fn on_invalid_block_hash(
        &mut self,
        computed: &str,
        stored: &str,
        stream: &Urn,
        offset: u64,
    ) -> Result<()> {
        let _ = (computed, stored);
        self.invalid_blocks.push((stream.to_string(), offset));
        Ok(())
    }

    fn on_valid_hash(&mut self, kind: &str, digest: &str, _subject: &Urn) {
        self.valid.push((kind.to_string(), digest.to_string()));
    }

    fn on_invalid_hash(
        &mut self,
        kind: &str,
        stored: &str,
        computed: &str,
        subject: &Urn,
    ) -> Result<()> {
        self.invalid.push((
            kind.to_string(),
            stored.to_string(),
            computed.to_string(),
            subject.to_string(),
        ));
        Ok(())
    }
}
