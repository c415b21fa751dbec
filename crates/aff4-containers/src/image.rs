//! The bevy-based image stream
//!
//! Data bytes are partitioned into fixed-size chunks, compressed per chunk,
//! and grouped into bevies. Each bevy and its index is a separate volume
//! segment. Reads go through a bounded LRU chunk cache.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::rc::Rc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use aff4_core::lexicon;
use aff4_core::{Error, Lexicon, Progress, RdfValue, Result, Urn};

use crate::object::ObjectGuard;
use crate::resolver::Resolver;
use crate::zip::records::ZIP_STORED;
use crate::zip::ZipVolume;

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
pub const DEFAULT_CHUNKS_PER_SEGMENT: usize = 1024;
const CHUNK_CACHE_CAPACITY: usize = 1000;
const COPY_BUFFER: usize = 64 * 1024;

/// Compress one chunk according to the compression method URN.
fn compress_chunk(method: &str, chunk: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    match method {
        lexicon::AFF4_IMAGE_COMPRESSION_ZLIB => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(chunk)?;
            Ok(encoder.finish()?)
        }
        lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(chunk)
                .map_err(|e| Error::format(format!("snappy compression failed: {}", e)))?;
            // Incompressible full chunks are stored raw; the reader treats a
            // stored length equal to the chunk size as passthrough.
            if compressed.len() >= chunk.len() && chunk.len() == chunk_size {
                Ok(chunk.to_vec())
            } else {
                Ok(compressed)
            }
        }
        lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY_SCUDETTE => snap::raw::Encoder::new()
            .compress_vec(chunk)
            .map_err(|e| Error::format(format!("snappy compression failed: {}", e))),
        lexicon::AFF4_IMAGE_COMPRESSION_STORED => Ok(chunk.to_vec()),
        other => Err(Error::format(format!(
            "unable to process compression {}",
            other
        ))),
    }
}

fn decompress_chunk(method: &str, data: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    match method {
        lexicon::AFF4_IMAGE_COMPRESSION_ZLIB => {
            let mut inflated = Vec::with_capacity(chunk_size);
            ZlibDecoder::new(data)
                .read_to_end(&mut inflated)
                .map_err(|e| Error::format(format!("zlib chunk inflate failed: {}", e)))?;
            Ok(inflated)
        }
        lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY => {
            if data.len() == chunk_size {
                // Passthrough for incompressible data.
                return Ok(data.to_vec());
            }
            snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| Error::format(format!("snappy chunk decode failed: {}", e)))
        }
        lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY_SCUDETTE => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::format(format!("snappy chunk decode failed: {}", e))),
        lexicon::AFF4_IMAGE_COMPRESSION_STORED => Ok(data.to_vec()),
        other => Err(Error::format(format!(
            "unable to process compression {}",
            other
        ))),
    }
}

/// The three bevy index formats found in the wild, behind one lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum BevyIndex {
    /// AFF4 Standard: `(u64 offset, u32 length)` pairs.
    Standard(Vec<(u64, u32)>),
    /// Scudette: `u32` chunk start offsets, first entry always 0.
    LegacyStart(Vec<u32>),
    /// Evimetry pre-standard: `u32` chunk end offsets, offset 0 implicit.
    LegacyEnd(Vec<u32>),
}

impl BevyIndex {
    pub fn parse_standard(data: &[u8]) -> Result<Self> {
        if data.len() % 12 != 0 {
            return Err(Error::format(format!(
                "bevy index length {} is not a multiple of 12",
                data.len()
            )));
        }
        let entries = data
            .chunks_exact(12)
            .map(|entry| {
                (
                    u64::from_le_bytes(entry[..8].try_into().unwrap()),
                    u32::from_le_bytes(entry[8..].try_into().unwrap()),
                )
            })
            .collect();
        Ok(BevyIndex::Standard(entries))
    }

    pub fn parse_legacy(data: &[u8]) -> Result<Self> {
        if data.len() % 4 != 0 {
            return Err(Error::format(format!(
                "bevy index length {} is not a multiple of 4",
                data.len()
            )));
        }
        let entries: Vec<u32> = data
            .chunks_exact(4)
            .map(|entry| u32::from_le_bytes(entry.try_into().unwrap()))
            .collect();
        match entries.first() {
            Some(0) => Ok(BevyIndex::LegacyStart(entries)),
            Some(_) => Ok(BevyIndex::LegacyEnd(entries)),
            None => Ok(BevyIndex::LegacyStart(entries)),
        }
    }

    pub fn chunk_count(&self) -> usize {
        match self {
            BevyIndex::Standard(entries) => entries.len(),
            BevyIndex::LegacyStart(entries) | BevyIndex::LegacyEnd(entries) => entries.len(),
        }
    }

    /// Offset and compressed length of a chunk within its bevy.
    pub fn lookup(&self, chunk_in_bevy: usize, bevy_size: u64) -> Result<(u64, u64)> {
        let count = self.chunk_count();
        if chunk_in_bevy >= count {
            return Err(Error::format(format!(
                "bevy index too short: chunk {} of {}",
                chunk_in_bevy, count
            )));
        }
        match self {
            BevyIndex::Standard(entries) => {
                let (offset, length) = entries[chunk_in_bevy];
                Ok((offset, length as u64))
            }
            BevyIndex::LegacyStart(entries) => {
                let offset = entries[chunk_in_bevy] as u64;
                let end = if chunk_in_bevy + 1 < count {
                    entries[chunk_in_bevy + 1] as u64
                } else {
                    bevy_size
                };
                Ok((offset, end - offset))
            }
            BevyIndex::LegacyEnd(entries) => {
                let offset = if chunk_in_bevy == 0 {
                    0
                } else {
                    entries[chunk_in_bevy - 1] as u64
                };
                Ok((offset, entries[chunk_in_bevy] as u64 - offset))
            }
        }
    }
}

/// Size-bounded LRU of decompressed chunks, keyed by absolute chunk id.
struct ChunkCache {
    cache: HashMap<u64, Rc<Vec<u8>>>,
    lru_queue: VecDeque<u64>,
    max_entries: usize,
}

impl ChunkCache {
    fn new(max_entries: usize) -> Self {
        Self {
            cache: HashMap::new(),
            lru_queue: VecDeque::new(),
            max_entries,
        }
    }

    fn get(&mut self, chunk_id: u64) -> Option<Rc<Vec<u8>>> {
        if let Some(data) = self.cache.get(&chunk_id) {
            self.lru_queue.retain(|&queued| queued != chunk_id);
            self.lru_queue.push_front(chunk_id);
            return Some(Rc::clone(data));
        }
        None
    }

    fn insert(&mut self, chunk_id: u64, data: Vec<u8>) -> Rc<Vec<u8>> {
        if self.cache.len() >= self.max_entries {
            if let Some(oldest) = self.lru_queue.pop_back() {
                self.cache.remove(&oldest);
            }
        }
        let data = Rc::new(data);
        self.cache.insert(chunk_id, Rc::clone(&data));
        self.lru_queue.push_front(chunk_id);
        data
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.lru_queue.clear();
    }
}

/// A stream which chunks up another stream: each `read` yields at most one
/// compressed chunk, and the stream dries up when the bevy is full.
struct CompressorStream<'s> {
    source: &'s mut dyn Read,
    chunk_size: usize,
    chunks_per_segment: usize,
    compression: String,
    pub chunk_count_in_bevy: usize,
    pub size: u64,
    pub bevy_index: Vec<(u64, u32)>,
    bevy_length: u64,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<'s> CompressorStream<'s> {
    fn new(
        source: &'s mut dyn Read,
        chunk_size: usize,
        chunks_per_segment: usize,
        compression: String,
    ) -> Self {
        Self {
            source,
            chunk_size,
            chunks_per_segment,
            compression,
            chunk_count_in_bevy: 0,
            size: 0,
            bevy_index: Vec::new(),
            bevy_length: 0,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn refill(&mut self) -> std::io::Result<bool> {
        if self.chunk_count_in_bevy >= self.chunks_per_segment {
            return Ok(false);
        }

        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let count = self.source.read(&mut chunk[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        if filled == 0 {
            return Ok(false);
        }
        chunk.truncate(filled);

        let compressed = compress_chunk(&self.compression, &chunk, self.chunk_size)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        self.bevy_index
            .push((self.bevy_length, compressed.len() as u32));
        self.bevy_length += compressed.len() as u64;
        self.chunk_count_in_bevy += 1;
        self.size += filled as u64;

        self.pending = compressed;
        self.pending_pos = 0;
        Ok(true)
    }
}

impl Read for CompressorStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending_pos >= self.pending.len() && !self.refill()? {
            return Ok(0);
        }
        let wanted = buf.len().min(self.pending.len() - self.pending_pos);
        buf[..wanted].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + wanted]);
        self.pending_pos += wanted;
        Ok(wanted)
    }
}

pub struct ImageStream {
    urn: Urn,
    volume_urn: Urn,
    pub chunk_size: usize,
    pub chunks_per_segment: usize,
    size: u64,
    pub compression: String,
    readptr: u64,
    dirty: bool,

    // Write-side accumulators.
    buffer: Vec<u8>,
    bevy: Vec<u8>,
    bevy_index: Vec<(u64, u32)>,
    chunk_count_in_bevy: usize,
    bevy_number: u64,

    cache: ChunkCache,
}

impl ImageStream {
    /// Register a new image stream contained in `volume_urn` and open it.
    pub fn create<'r>(
        resolver: &'r Resolver,
        image_urn: &Urn,
        volume_urn: &Urn,
    ) -> Result<ObjectGuard<'r>> {
        {
            let volume = resolver.open(volume_urn)?;
            let mut object = volume.borrow_mut();
            object.as_volume()?.children.insert(image_urn.clone());
        }

        resolver.set(
            image_urn,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(Urn::new(lexicon::AFF4_IMAGE_TYPE)),
        );
        resolver.set(
            image_urn,
            lexicon::AFF4_STORED,
            RdfValue::Urn(volume_urn.clone()),
        );

        resolver.open(image_urn)
    }

    pub fn load(resolver: &Resolver, urn: &Urn) -> Result<Self> {
        let volume_urn = stored_volume(resolver, urn).ok_or_else(|| {
            Error::not_found(format!("unable to find storage for urn {}", urn))
        })?;

        let chunk_size = first_integer(
            resolver,
            urn,
            &[
                lexicon::AFF4_IMAGE_CHUNK_SIZE,
                lexicon::AFF4_LEGACY_IMAGE_CHUNK_SIZE,
                &Lexicon::Scudette.chunk_size(),
            ],
        )
        .unwrap_or(DEFAULT_CHUNK_SIZE as i64) as usize;

        let chunks_per_segment = first_integer(
            resolver,
            urn,
            &[
                lexicon::AFF4_IMAGE_CHUNKS_PER_SEGMENT,
                lexicon::AFF4_LEGACY_IMAGE_CHUNKS_PER_SEGMENT,
                &Lexicon::Scudette.chunks_per_segment(),
            ],
        )
        .unwrap_or(DEFAULT_CHUNKS_PER_SEGMENT as i64) as usize;

        let size = first_integer(
            resolver,
            urn,
            &[lexicon::AFF4_STREAM_SIZE, lexicon::AFF4_LEGACY_STREAM_SIZE],
        )
        .unwrap_or(0) as u64;

        let compression = first_urn_or_text(
            resolver,
            urn,
            &[
                lexicon::AFF4_IMAGE_COMPRESSION,
                lexicon::AFF4_LEGACY_IMAGE_COMPRESSION,
                &Lexicon::Scudette.compression_method(),
            ],
        )
        .unwrap_or_else(|| lexicon::AFF4_IMAGE_COMPRESSION_ZLIB.to_string());

        Ok(Self {
            urn: urn.clone(),
            volume_urn,
            chunk_size,
            chunks_per_segment,
            size,
            compression,
            readptr: 0,
            dirty: false,
            buffer: Vec::new(),
            bevy: Vec::new(),
            bevy_index: Vec::new(),
            chunk_count_in_bevy: 0,
            bevy_number: 0,
            cache: ChunkCache::new(CHUNK_CACHE_CAPACITY),
        })
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    pub fn volume_urn(&self) -> &Urn {
        &self.volume_urn
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn readptr(&self) -> u64 {
        self.readptr
    }

    pub fn set_readptr(&mut self, offset: u64) {
        self.readptr = offset;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn bevy_urn(&self, bevy_number: u64) -> Urn {
        self.urn.append(&format!("{:08}", bevy_number))
    }

    fn bevy_index_urn(&self, flavor: Lexicon, bevy_number: u64) -> Urn {
        match flavor {
            Lexicon::Standard => self.urn.append(&format!("{:08}.index", bevy_number)),
            _ => self.bevy_urn(bevy_number).append("index"),
        }
    }

    fn index_bytes(&self, flavor: Lexicon, entries: &[(u64, u32)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        match flavor {
            Lexicon::Standard => {
                for (offset, length) in entries {
                    bytes.extend_from_slice(&offset.to_le_bytes());
                    bytes.extend_from_slice(&length.to_le_bytes());
                }
            }
            _ => {
                for (offset, _) in entries {
                    bytes.extend_from_slice(&(*offset as u32).to_le_bytes());
                }
            }
        }
        bytes
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    pub fn write(&mut self, resolver: &Resolver, data: &[u8]) -> Result<usize> {
        self.dirty = true;
        self.buffer.extend_from_slice(data);

        let mut index = 0;
        while self.buffer.len() - index >= self.chunk_size {
            let chunk = self.buffer[index..index + self.chunk_size].to_vec();
            index += self.chunk_size;
            self.flush_chunk(&chunk)?;
            if self.chunk_count_in_bevy >= self.chunks_per_segment {
                self.flush_bevy(resolver)?;
            }
        }
        self.buffer.drain(..index);

        self.readptr += data.len() as u64;
        if self.readptr > self.size {
            self.size = self.readptr;
        }
        Ok(data.len())
    }

    /// Compress a chunk into the pending bevy.
    fn flush_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let compressed = compress_chunk(&self.compression, chunk, self.chunk_size)?;
        self.bevy_index
            .push((self.bevy.len() as u64, compressed.len() as u32));
        self.bevy.extend_from_slice(&compressed);
        self.chunk_count_in_bevy += 1;
        Ok(())
    }

    /// Emit the pending bevy and its index through the resolver.
    fn flush_bevy(&mut self, resolver: &Resolver) -> Result<()> {
        if self.bevy.is_empty() {
            return Ok(());
        }
        let volume_urn = self.volume_urn.clone();
        let volume = resolver.open(&volume_urn)?;
        let mut object = volume.borrow_mut();
        self.emit_bevy(resolver, object.as_volume()?)
    }

    /// Emit the pending bevy into an already-borrowed volume.
    fn emit_bevy(&mut self, resolver: &Resolver, volume: &mut ZipVolume) -> Result<()> {
        if self.bevy.is_empty() {
            return Ok(());
        }

        let flavor = resolver.lexicon();
        let index_urn = self.bevy_index_urn(flavor, self.bevy_number);
        let bevy_urn = self.bevy_urn(self.bevy_number);
        let index_bytes = self.index_bytes(flavor, &self.bevy_index);

        volume.write_member(resolver, &index_urn, &index_bytes, ZIP_STORED)?;
        volume.write_member(resolver, &bevy_urn, &self.bevy, ZIP_STORED)?;

        self.chunk_count_in_bevy = 0;
        self.bevy_number += 1;
        self.bevy.clear();
        self.bevy_index.clear();
        Ok(())
    }

    fn write_metadata(&self, resolver: &Resolver) {
        resolver.set(
            &self.urn,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(Urn::new(lexicon::AFF4_IMAGE_TYPE)),
        );
        resolver.set(
            &self.urn,
            lexicon::AFF4_IMAGE_CHUNK_SIZE,
            RdfValue::Integer(self.chunk_size as i64),
        );
        resolver.set(
            &self.urn,
            lexicon::AFF4_IMAGE_CHUNKS_PER_SEGMENT,
            RdfValue::Integer(self.chunks_per_segment as i64),
        );
        resolver.set(
            &self.urn,
            lexicon::AFF4_STREAM_SIZE,
            RdfValue::Integer(self.size as i64),
        );
        resolver.set(
            &self.urn,
            lexicon::AFF4_IMAGE_COMPRESSION,
            RdfValue::Urn(Urn::new(&*self.compression)),
        );
    }

    /// Copy a source stream in one pass, a bevy at a time. Each bevy is
    /// streamed into the volume without being accumulated in memory.
    pub fn write_stream(
        &mut self,
        resolver: &Resolver,
        source: &mut dyn Read,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let volume_urn = self.volume_urn.clone();
        loop {
            let mut compressor = CompressorStream::new(
                source,
                self.chunk_size,
                self.chunks_per_segment,
                self.compression.clone(),
            );

            progress.set_start(
                self.bevy_number * self.chunks_per_segment as u64 * self.chunk_size as u64,
            );

            let bevy_urn = self.bevy_urn(self.bevy_number);
            let flavor = resolver.lexicon();
            let index_urn = self.bevy_index_urn(flavor, self.bevy_number);

            {
                let volume = resolver.open(&volume_urn)?;
                let mut object = volume.borrow_mut();
                let volume = object.as_volume()?;
                volume.stream_add_member(
                    resolver,
                    &bevy_urn,
                    &mut compressor,
                    ZIP_STORED,
                    progress,
                )?;
                let index_bytes = self.index_bytes(flavor, &compressor.bevy_index);
                volume.write_member(resolver, &index_urn, &index_bytes, ZIP_STORED)?;
            }

            self.bevy_number += 1;
            self.size += compressor.size;
            self.readptr += compressor.size;

            // The compressor quit before the bevy was full: end of source.
            if compressor.chunk_count_in_bevy != self.chunks_per_segment {
                break;
            }
        }
        self.write_metadata(resolver);
        Ok(())
    }

    /// Standalone flush: short tail chunk, tail bevy, metadata.
    pub fn flush(&mut self, resolver: &Resolver) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.flush_chunk(&tail)?;
        }
        self.flush_bevy(resolver)?;
        self.write_metadata(resolver);
        self.dirty = false;
        Ok(())
    }

    /// Flush driven by the owning volume.
    pub fn flush_into(&mut self, resolver: &Resolver, volume: &mut ZipVolume) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.flush_chunk(&tail)?;
        }
        self.emit_bevy(resolver, volume)?;
        self.write_metadata(resolver);
        self.dirty = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    pub fn read(&mut self, resolver: &Resolver, length: usize) -> Result<Vec<u8>> {
        if length == 0 || self.readptr >= self.size {
            return Ok(Vec::new());
        }
        let length = (length as u64).min(self.size - self.readptr) as usize;

        let initial_chunk = self.readptr / self.chunk_size as u64;
        let initial_offset = (self.readptr % self.chunk_size as u64) as usize;
        let final_chunk = (self.readptr + length as u64 - 1) / self.chunk_size as u64;

        let mut assembled = Vec::with_capacity(length + self.chunk_size);
        for chunk_id in initial_chunk..=final_chunk {
            let chunk = self.read_chunk(resolver, chunk_id)?;
            assembled.extend_from_slice(&chunk);
        }

        let mut result = assembled.split_off(initial_offset.min(assembled.len()));
        result.truncate(length);
        self.readptr += result.len() as u64;
        Ok(result)
    }

    fn read_chunk(&mut self, resolver: &Resolver, chunk_id: u64) -> Result<Rc<Vec<u8>>> {
        if let Some(cached) = self.cache.get(chunk_id) {
            return Ok(cached);
        }

        let bevy_id = chunk_id / self.chunks_per_segment as u64;
        let chunk_in_bevy = (chunk_id % self.chunks_per_segment as u64) as usize;
        let bevy_urn = self.bevy_urn(bevy_id);

        let index = self.open_bevy_index(resolver, bevy_id)?;
        if index.chunk_count() == 0 {
            return Err(Error::format(format!(
                "index empty in {}: {}",
                self.urn, chunk_id
            )));
        }

        let bevy = resolver.open(&bevy_urn)?;
        let mut bevy_object = bevy.borrow_mut();
        let bevy_size = bevy_object.size(resolver)?;

        let (offset, compressed_length) = index.lookup(chunk_in_bevy, bevy_size)?;
        let compressed =
            bevy_object.read_at(resolver, offset, compressed_length as usize)?;
        if compressed.len() != compressed_length as usize {
            return Err(Error::format(format!(
                "bevy {} truncated: wanted {} bytes at {}, got {}",
                bevy_urn,
                compressed_length,
                offset,
                compressed.len()
            )));
        }

        let chunk = decompress_chunk(&self.compression, &compressed, self.chunk_size)?;
        Ok(self.cache.insert(chunk_id, chunk))
    }

    /// Locate and parse the bevy's index segment, trying the standard
    /// sibling naming first and the pre-standard nested naming second.
    fn open_bevy_index(&self, resolver: &Resolver, bevy_id: u64) -> Result<BevyIndex> {
        let standard_urn = self.urn.append(&format!("{:08}.index", bevy_id));
        let legacy_urn = self.bevy_urn(bevy_id).append("index");

        for (candidate, standard) in [(standard_urn, true), (legacy_urn, false)] {
            match resolver.open(&candidate) {
                Ok(guard) => {
                    let mut object = guard.borrow_mut();
                    let size = object.size(resolver)? as usize;
                    let data = object.read(resolver, size)?;
                    return if standard {
                        BevyIndex::parse_standard(&data)
                    } else {
                        BevyIndex::parse_legacy(&data)
                    };
                }
                Err(Error::NotFound(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(Error::not_found(format!(
            "missing bevy index for bevy {} of {}",
            bevy_id, self.urn
        )))
    }

    /// Drop all cached chunks (after overwriting, or for tests).
    pub fn invalidate_cache(&mut self) {
        self.cache.clear();
    }
}

pub(crate) fn stored_volume(resolver: &Resolver, urn: &Urn) -> Option<Urn> {
    for predicate in [
        lexicon::AFF4_STORED,
        "http://afflib.org/2009/aff4#stored",
    ] {
        if let Some(volume) = resolver.get_urn(urn, predicate) {
            return Some(volume);
        }
    }
    None
}

fn first_integer(resolver: &Resolver, urn: &Urn, predicates: &[&str]) -> Option<i64> {
    predicates
        .iter()
        .find_map(|predicate| resolver.get_integer(urn, predicate))
}

fn first_urn_or_text(resolver: &Resolver, urn: &Urn, predicates: &[&str]) -> Option<String> {
    predicates.iter().find_map(|predicate| {
        resolver.get(urn, predicate).map(|value| match value {
            RdfValue::Urn(urn) => urn.to_string(),
            other => other.serialize(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_roundtrip() {
        let chunk = b"hello world hello world hello world";
        for method in [
            lexicon::AFF4_IMAGE_COMPRESSION_ZLIB,
            lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY,
            lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY_SCUDETTE,
            lexicon::AFF4_IMAGE_COMPRESSION_STORED,
        ] {
            let compressed = compress_chunk(method, chunk, 1024).unwrap();
            let restored = decompress_chunk(method, &compressed, 1024).unwrap();
            assert_eq!(restored, chunk, "roundtrip failed for {}", method);
        }
    }

    #[test]
    fn test_unknown_compression_is_fatal() {
        assert!(compress_chunk("http://example.com/lzma", b"x", 1024).is_err());
        assert!(decompress_chunk("http://example.com/lzma", b"x", 1024).is_err());
    }

    #[test]
    fn test_snappy_incompressible_passthrough() {
        // A full-size chunk of uniform noise stays raw and decodes as-is.
        let chunk: Vec<u8> = (0..64u32)
            .flat_map(|i| i.wrapping_mul(2654435761).to_le_bytes())
            .collect();
        let compressed =
            compress_chunk(lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY, &chunk, chunk.len()).unwrap();
        if compressed.len() == chunk.len() {
            let restored =
                decompress_chunk(lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY, &compressed, chunk.len())
                    .unwrap();
            assert_eq!(restored, chunk);
        }
    }

    #[test]
    fn test_standard_index_lookup() {
        let index = BevyIndex::Standard(vec![(0, 10), (10, 20), (30, 5)]);
        assert_eq!(index.lookup(0, 35).unwrap(), (0, 10));
        assert_eq!(index.lookup(2, 35).unwrap(), (30, 5));
        assert!(index.lookup(3, 35).is_err());
    }

    #[test]
    fn test_legacy_start_index_lookup() {
        // Scudette: start offsets, first entry 0.
        let data: Vec<u8> = [0u32, 10, 25]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let index = BevyIndex::parse_legacy(&data).unwrap();
        assert_eq!(index, BevyIndex::LegacyStart(vec![0, 10, 25]));
        assert_eq!(index.lookup(0, 40).unwrap(), (0, 10));
        assert_eq!(index.lookup(1, 40).unwrap(), (10, 15));
        // Tail length runs to the end of the bevy.
        assert_eq!(index.lookup(2, 40).unwrap(), (25, 15));
    }

    #[test]
    fn test_legacy_end_index_lookup() {
        // Evimetry: end offsets, offset 0 implicit.
        let data: Vec<u8> = [10u32, 25, 40]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let index = BevyIndex::parse_legacy(&data).unwrap();
        assert_eq!(index, BevyIndex::LegacyEnd(vec![10, 25, 40]));
        assert_eq!(index.lookup(0, 40).unwrap(), (0, 10));
        assert_eq!(index.lookup(1, 40).unwrap(), (10, 15));
        assert_eq!(index.lookup(2, 40).unwrap(), (25, 15));
    }

    #[test]
    fn test_standard_index_parse_rejects_misaligned() {
        assert!(BevyIndex::parse_standard(&[0u8; 13]).is_err());
        assert!(BevyIndex::parse_legacy(&[0u8; 6]).is_err());
    }

    #[test]
    fn test_chunk_cache_eviction() {
        let mut cache = ChunkCache::new(2);
        cache.insert(1, vec![1]);
        cache.insert(2, vec![2]);
        assert!(cache.get(1).is_some());
        // 2 is now least recently used and gets evicted.
        cache.insert(3, vec![3]);
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }

    use crate::resolver::Resolver;
    use crate::zip::ZipVolume;

    fn expected_image_content() -> Vec<u8> {
        let mut content = Vec::new();
        for i in 0..100 {
            content.extend_from_slice(format!("Hello world {:02}!", i).as_bytes());
        }
        content
    }

    fn write_test_image(backing: &Urn) -> Urn {
        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );

        let volume = ZipVolume::create(&resolver, backing).unwrap();
        let volume_urn = volume.urn();
        let image_urn = volume_urn.append("image.dd");

        {
            let image = ImageStream::create(&resolver, &image_urn, &volume_urn).unwrap();
            let mut object = image.borrow_mut();
            let stream = object.as_image().unwrap();
            stream.chunk_size = 10;
            stream.chunks_per_segment = 3;
            for i in 0..100 {
                stream
                    .write(&resolver, format!("Hello world {:02}!", i).as_bytes())
                    .unwrap();
            }
        }

        drop(volume);
        resolver.flush().unwrap();
        image_urn
    }

    #[test]
    fn test_image_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_filename(dir.path().join("image.aff4").to_str().unwrap());
        let image_urn = write_test_image(&backing);

        // A fresh resolver must load all metadata from the volume.
        let resolver = Resolver::new(Lexicon::Standard);
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        drop(volume);

        let image = resolver.open(&image_urn).unwrap();
        let mut object = image.borrow_mut();
        {
            let stream = object.as_image().unwrap();
            assert_eq!(stream.chunk_size, 10);
            assert_eq!(stream.chunks_per_segment, 3);
            assert_eq!(stream.size(), 1500);
        }

        let data = object.read(&resolver, 100).unwrap();
        assert_eq!(data, expected_image_content()[..100].to_vec());
    }

    #[test]
    fn test_image_random_access() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_filename(dir.path().join("seek.aff4").to_str().unwrap());
        let image_urn = write_test_image(&backing);

        let resolver = Resolver::new(Lexicon::Standard);
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        drop(volume);

        let expected = expected_image_content();
        let image = resolver.open(&image_urn).unwrap();
        let mut object = image.borrow_mut();

        // Reads crossing chunk and bevy boundaries.
        for (offset, length) in [(5usize, 10usize), (25, 40), (1490, 100), (0, 1500)] {
            object.set_readptr(offset as u64);
            let data = object.read(&resolver, length).unwrap();
            let end = (offset + length).min(expected.len());
            assert_eq!(data, expected[offset..end].to_vec(), "at offset {}", offset);
        }

        // Reads past the end are short.
        object.set_readptr(2000);
        assert!(object.read(&resolver, 10).unwrap().is_empty());
    }

    #[test]
    fn test_image_write_stream() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_filename(dir.path().join("ws.aff4").to_str().unwrap());
        let content = expected_image_content();

        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            &backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        let volume_urn = volume.urn();
        let image_urn = volume_urn.append("image.dd");
        {
            let image = ImageStream::create(&resolver, &image_urn, &volume_urn).unwrap();
            let mut object = image.borrow_mut();
            let stream = object.as_image().unwrap();
            stream.chunk_size = 10;
            stream.chunks_per_segment = 3;
            let mut source = std::io::Cursor::new(content.clone());
            stream
                .write_stream(&resolver, &mut source, &mut aff4_core::NoProgress)
                .unwrap();
            assert_eq!(stream.size(), 1500);
        }
        drop(volume);
        resolver.flush().unwrap();

        let resolver = Resolver::new(Lexicon::Standard);
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        drop(volume);
        let image = resolver.open(&image_urn).unwrap();
        let data = image.borrow_mut().read(&resolver, 1500).unwrap();
        assert_eq!(data, content);
    }
}
