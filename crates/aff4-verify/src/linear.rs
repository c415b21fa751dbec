//! Linear (flat) image hashing
//!
//! Reads the map stream start to end in 32 KiB steps and digests the
//! logical image, sparse regions included.

use aff4_core::hashes::{HashKind, HashSink};
use aff4_core::{Error, RdfValue, Result, Urn};
use aff4_containers::{Container, Resolver, ZipVolume};

const READ_STEP: u64 = 32 * 1024;

pub struct LinearHasher;

impl LinearHasher {
    /// Hash the map stream of a single container.
    pub fn hash(container: &Urn, map_urn: &Urn, kind: HashKind) -> Result<RdfValue> {
        let flavor = Container::identify_urn(container)?;
        let resolver = Resolver::new(flavor);
        {
            let volume = ZipVolume::create(&resolver, container)?;
            drop(volume);
        }
        Self::hash_with_resolver(&resolver, map_urn, kind)
    }

    /// Hash a map striped across two containers.
    pub fn hash_multi(
        container_a: &Urn,
        container_b: &Urn,
        map_urn: &Urn,
        kind: HashKind,
    ) -> Result<RdfValue> {
        let flavor = Container::identify_urn(container_a)?;
        let resolver = Resolver::new(flavor);
        for container in [container_a, container_b] {
            let volume = ZipVolume::create(&resolver, container)?;
            drop(volume);
        }
        Self::hash_with_resolver(&resolver, map_urn, kind)
    }

    pub fn hash_with_resolver(
        resolver: &Resolver,
        map_urn: &Urn,
        kind: HashKind,
    ) -> Result<RdfValue> {
        let guard = resolver.open(map_urn)?;
        let mut object = guard.borrow_mut();
        // Only maps present the logical image.
        object.as_map()?;

        let mut remaining = object.size(resolver)?;
        object.set_readptr(0);

        let mut sink = HashSink::new(kind);
        while remaining > 0 {
            let step = remaining.min(READ_STEP) as usize;
            let data = object.read(resolver, step)?;
            if data.len() != step {
                return Err(Error::format(format!(
                    "short read while hashing {}: wanted {}, got {}",
                    map_urn,
                    step,
                    data.len()
                )));
            }
            remaining -= data.len() as u64;
            sink.update(&data);
        }

        Ok(RdfValue::Hash(kind, sink.finalize_hex()))
    }
}
