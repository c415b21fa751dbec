//! # AFF4 Core
//!
//! Foundational pieces for the AFF4 (Advanced Forensic Format v4) library:
//!
//! - **Errors**: the failure taxonomy shared by every crate
//! - **Codec**: declarative little-endian binary records
//! - **RDF values**: URNs and typed literals
//! - **Lexicon**: the AFF4 vocabulary across the three dialect generations
//! - **Hashes**: algorithm registry and streaming digests
//! - **Progress**: reporting and cancellation for long copies

pub mod codec;
pub mod error;
pub mod hashes;
pub mod lexicon;
pub mod progress;
pub mod rdf;
pub mod traits;

// Re-export commonly used items
pub use error::{Error, Result};
pub use hashes::{HashKind, HashSink};
pub use lexicon::Lexicon;
pub use progress::{NoProgress, Progress, TracingProgress};
pub use rdf::{RdfValue, Urn};
pub use traits::{ReadSeek, ReadWriteSeek};
