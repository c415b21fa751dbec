//! Block-hash production
//!
//! Produces the full hash scheme for an image/map pair written with this
//! library: per-chunk block-hash segments, the per-algorithm
//! `blockHashesHash`, the map segment hashes, and the per-volume
//! `blockMapHash` — exactly the predicates the validator checks.

use aff4_core::hashes::{HashKind, HashSink};
use aff4_core::{Error, RdfValue, Result, Urn};
use aff4_containers::Resolver;

use crate::block::Validator;
use crate::StrictListener;

pub struct BlockHashWriter {
    /// Block-hash algorithms to store, one segment each.
    algorithms: Vec<HashKind>,
    /// Digest used for the map segment hashes.
    segment_kind: HashKind,
    /// Datatype of the stored blockMapHash.
    map_kind: HashKind,
}

impl Default for BlockHashWriter {
    fn default() -> Self {
        Self {
            algorithms: vec![HashKind::Md5, HashKind::Sha1],
            segment_kind: HashKind::Sha512,
            map_kind: HashKind::BlockMapSha512,
        }
    }
}

impl BlockHashWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_algorithms(mut self, algorithms: Vec<HashKind>) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Hash an image stream and its map, storing every layer of the
    /// scheme. Returns the computed blockMapHash.
    pub fn hash_pair(
        &self,
        resolver: &Resolver,
        map_urn: &Urn,
        image_urn: &Urn,
    ) -> Result<RdfValue> {
        let flavor = resolver.lexicon();

        // The segments must exist before they can be hashed.
        {
            let image = resolver.open(image_urn)?;
            image.borrow_mut().flush(resolver)?;
        }
        {
            let map = resolver.open(map_urn)?;
            map.borrow_mut().flush(resolver)?;
        }

        // Per-chunk digests, folded per algorithm.
        let image = resolver.open(image_urn)?;
        let (chunk_size, stream_size, volume_urn) = {
            let mut object = image.borrow_mut();
            let stream = object.as_image()?;
            (
                stream.chunk_size,
                stream.size(),
                stream.volume_urn().clone(),
            )
        };

        let mut segments: Vec<Vec<u8>> = vec![Vec::new(); self.algorithms.len()];
        let mut folds: Vec<HashSink> = self
            .algorithms
            .iter()
            .map(|algo| HashSink::new(*algo))
            .collect();

        let mut offset = 0u64;
        while offset < stream_size {
            let block = {
                let mut object = image.borrow_mut();
                object.set_readptr(offset);
                object.read(resolver, chunk_size)?
            };
            if block.is_empty() {
                return Err(Error::format(format!(
                    "short read at {} while hashing {}",
                    offset, image_urn
                )));
            }

            for (index, algo) in self.algorithms.iter().enumerate() {
                let mut sink = HashSink::new(*algo);
                sink.update(&block);
                let digest = sink.finalize();
                segments[index].extend_from_slice(&digest);
                folds[index].update(&digest);
            }
            offset += chunk_size as u64;
        }
        drop(image);

        // Store the block-hash segments and their fold digests.
        let mut block_hashes: Vec<(HashKind, String)> = Vec::new();
        {
            let volume = resolver.open(&volume_urn)?;
            let mut object = volume.borrow_mut();
            let zip = object.as_volume()?;
            for ((algo, bytes), fold) in self.algorithms.iter().zip(segments).zip(folds) {
                let segment_urn =
                    image_urn.append(&format!("blockhash.{}", algo.short_name()));
                zip.write_member(
                    resolver,
                    &segment_urn,
                    &bytes,
                    aff4_containers::zip::records::ZIP_STORED,
                )?;

                let fold_hex = fold.finalize_hex();
                resolver.set(
                    &segment_urn,
                    &flavor.hash(),
                    RdfValue::Hash(*algo, fold_hex.clone()),
                );
                block_hashes.push((*algo, fold_hex));
            }
        }
        block_hashes.sort_by_key(|(algo, _)| algo.ordering());

        // Map segment hashes.
        let map_point = self.segment_digest(resolver, map_urn, "map")?;
        let map_idx = self.segment_digest(resolver, map_urn, "idx")?;
        resolver.set(
            map_urn,
            &flavor.map_point_hash(),
            RdfValue::Hash(self.segment_kind, map_point.clone()),
        );
        resolver.set(
            map_urn,
            &flavor.map_idx_hash(),
            RdfValue::Hash(self.segment_kind, map_idx.clone()),
        );

        // The whole-map hash covers the concatenated segments.
        {
            let mut sink = HashSink::new(self.segment_kind);
            sink.update(&read_segment(resolver, map_urn, "map")?);
            sink.update(&read_segment(resolver, map_urn, "idx")?);
            resolver.set(
                map_urn,
                &flavor.map_hash(),
                RdfValue::Hash(self.segment_kind, sink.finalize_hex()),
            );
        }

        // Linkage the validator walks.
        resolver.add(
            map_urn,
            &flavor.dependent_stream(),
            RdfValue::Urn(image_urn.clone()),
        );
        resolver.add(image_urn, &flavor.target(), RdfValue::Urn(map_urn.clone()));

        // Fold everything into the blockMapHash.
        let mut sink = HashSink::new(self.map_kind);
        for (algo, fold_hex) in &block_hashes {
            sink.update(&aff4_core::hashes::decode_digest(*algo, fold_hex)?);
        }
        sink.update(&aff4_core::hashes::decode_digest(
            self.segment_kind,
            &map_point,
        )?);
        sink.update(&aff4_core::hashes::decode_digest(
            self.segment_kind,
            &map_idx,
        )?);

        let block_map_hash = RdfValue::Hash(self.map_kind, sink.finalize_hex());
        resolver.set(map_urn, &flavor.block_map_hash(), block_map_hash.clone());
        Ok(block_map_hash)
    }

    /// Declare the top-level Image subject with its data stream and the
    /// single-volume AFF4 hash.
    pub fn declare_image(
        &self,
        resolver: &Resolver,
        image_subject: &Urn,
        map_urn: &Urn,
        block_map_hash: RdfValue,
    ) {
        let flavor = resolver.lexicon();
        resolver.set(
            image_subject,
            aff4_core::lexicon::AFF4_TYPE,
            RdfValue::Urn(Urn::new(flavor.image_type())),
        );
        resolver.add(
            image_subject,
            &flavor.data_stream(),
            RdfValue::Urn(map_urn.clone()),
        );
        resolver.set(image_subject, &flavor.hash(), block_map_hash);
    }

    fn segment_digest(&self, resolver: &Resolver, map: &Urn, sub: &str) -> Result<String> {
        let mut sink = HashSink::new(self.segment_kind);
        sink.update(&read_segment(resolver, map, sub)?);
        Ok(sink.finalize_hex())
    }
}

fn read_segment(resolver: &Resolver, parent: &Urn, sub: &str) -> Result<Vec<u8>> {
    let guard = resolver.open(&parent.append(sub))?;
    let mut object = guard.borrow_mut();
    let size = object.size(resolver)? as usize;
    object.read(resolver, size)
}

/// Convenience: validate a container with the strict listener.
pub fn verify_container(urn: &Urn) -> Result<()> {
    let mut listener = StrictListener;
    Validator::new(&mut listener).validate_container(urn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectingListener, LinearHasher};
    use aff4_core::lexicon;
    use aff4_core::Lexicon;
    use aff4_containers::{ImageStream, MapStream, ZipVolume};

    fn test_content() -> Vec<u8> {
        let mut content = Vec::new();
        for i in 0..100 {
            content.extend_from_slice(format!("Hello world {:02}!", i).as_bytes());
        }
        content
    }

    /// Write a hashed container and return (backing, map URN).
    fn write_hashed_container(path: &str) -> (Urn, Urn) {
        let backing = Urn::from_filename(path);
        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            &backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );

        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        let volume_urn = volume.urn();
        let image_urn = volume_urn.append("disk.dd");
        let map_urn = volume_urn.append("disk.map");
        let content = test_content();

        {
            let image = ImageStream::create(&resolver, &image_urn, &volume_urn).unwrap();
            let mut object = image.borrow_mut();
            let stream = object.as_image().unwrap();
            stream.chunk_size = 10;
            stream.chunks_per_segment = 3;
            stream.write(&resolver, &content).unwrap();
        }

        {
            let map = MapStream::create(&resolver, &map_urn, &volume_urn).unwrap();
            let mut object = map.borrow_mut();
            object
                .as_map()
                .unwrap()
                .add_range(0, 0, content.len() as u64, &image_urn)
                .unwrap();
        }

        let writer = BlockHashWriter::new();
        let block_map_hash = writer.hash_pair(&resolver, &map_urn, &image_urn).unwrap();

        let image_subject = volume_urn.append("disk");
        writer.declare_image(&resolver, &image_subject, &map_urn, block_map_hash);

        drop(volume);
        resolver.flush().unwrap();
        (backing, map_urn)
    }

    #[test]
    fn test_block_hash_pipeline_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashed.aff4");
        let (backing, _) = write_hashed_container(path.to_str().unwrap());

        verify_container(&backing).unwrap();
    }

    #[test]
    fn test_collecting_listener_sees_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layers.aff4");
        let (backing, _) = write_hashed_container(path.to_str().unwrap());

        let mut listener = CollectingListener::default();
        Validator::new(&mut listener)
            .validate_container(&backing)
            .unwrap();

        assert!(listener.invalid.is_empty());
        assert!(listener.invalid_blocks.is_empty());
        let kinds: Vec<&str> = listener.valid.iter().map(|(kind, _)| kind.as_str()).collect();
        for expected in [
            "BlockHashesHash",
            "mapIdxHash",
            "mapPointHash",
            "mapHash",
            "BlockMapHash",
            "AFF4Hash",
        ] {
            assert!(kinds.contains(&expected), "missing layer {}", expected);
        }
    }

    #[test]
    fn test_tampered_hash_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tampered.aff4");
        let (backing, map_urn) = write_hashed_container(path.to_str().unwrap());

        // Load the container and corrupt the stored blockMapHash.
        let flavor = aff4_containers::Container::identify_urn(&backing).unwrap();
        let resolver = Resolver::new(flavor);
        {
            let volume = ZipVolume::create(&resolver, &backing).unwrap();
            drop(volume);
        }
        resolver.set(
            &map_urn,
            &flavor.block_map_hash(),
            RdfValue::Hash(HashKind::BlockMapSha512, "00".repeat(64)),
        );

        let mut listener = CollectingListener::default();
        Validator::new(&mut listener)
            .validate_with_resolver(&resolver, flavor)
            .unwrap();
        assert!(listener
            .invalid
            .iter()
            .any(|(kind, _, _, _)| kind == "BlockMapHash"));
    }

    #[test]
    fn test_linear_hash_matches_direct_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear.aff4");
        let (backing, map_urn) = write_hashed_container(path.to_str().unwrap());

        let computed = LinearHasher::hash(&backing, &map_urn, HashKind::Sha1).unwrap();

        use sha1::{Digest, Sha1};
        let mut direct = Sha1::new();
        direct.update(test_content());
        let expected = hex::encode(direct.finalize());

        assert_eq!(computed, RdfValue::Hash(HashKind::Sha1, expected));
    }
}
