//! The map stream
//!
//! A sparse translation from a logical address space into concrete backing
//! streams. Ranges are kept non-overlapping and non-empty in a search tree
//! keyed by logical offset; adjacent ranges describing the same affine
//! translation into the same target merge automatically.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use aff4_core::{binary_record, lexicon};
use aff4_core::{Error, Progress, RdfValue, Result, Urn};

use crate::image::{stored_volume, ImageStream};
use crate::object::ObjectGuard;
use crate::resolver::Resolver;
use crate::zip::records::ZIP_STORED;
use crate::zip::ZipVolume;

const COPY_BUFFER: usize = 64 * 1024;

binary_record! {
    /// Serialized form of one mapping range (`<Q Q Q I>` little-endian).
    pub struct MapPoint {
        map_offset: u64,
        target_offset: u64,
        length: u64,
        target_id: u32,
    }
}

/// One mapping range: `[map_offset, map_offset+length)` reads from
/// `target_offset` in target `target_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    pub map_offset: u64,
    pub target_offset: u64,
    pub length: u64,
    pub target_id: u32,
}

impl MapRange {
    pub fn map_end(&self) -> u64 {
        self.map_offset + self.length
    }

    /// The target offset backing a given logical offset.
    pub fn target_offset_at(&self, offset: u64) -> u64 {
        self.target_offset + offset - self.map_offset
    }

    fn translation(&self) -> i128 {
        self.target_offset as i128 - self.map_offset as i128
    }

    /// Merge two ranges describing the same affine translation into the
    /// same target. `None` when they are not mergeable.
    pub fn merge(&self, other: &MapRange) -> Option<MapRange> {
        if other.target_id != self.target_id || other.translation() != self.translation() {
            return None;
        }

        let start = self.map_offset.min(other.map_offset);
        let end = self.map_end().max(other.map_end());
        let target_offset = if self.map_offset <= other.map_offset {
            self.target_offset
        } else {
            other.target_offset
        };

        Some(MapRange {
            map_offset: start,
            target_offset,
            length: end - start,
            target_id: self.target_id,
        })
    }

    /// Trim the range so it starts at `offset`.
    pub fn left_clip(&self, offset: u64) -> Result<MapRange> {
        if !(self.map_offset <= offset && offset <= self.map_end()) {
            return Err(Error::programmer(format!(
                "clip offset {} is not inside range [{}, {})",
                offset,
                self.map_offset,
                self.map_end()
            )));
        }
        let adjustment = offset - self.map_offset;
        Ok(MapRange {
            map_offset: self.map_offset + adjustment,
            target_offset: self.target_offset + adjustment,
            length: self.length - adjustment,
            target_id: self.target_id,
        })
    }

    /// Trim the range so it ends at `offset`.
    pub fn right_clip(&self, offset: u64) -> Result<MapRange> {
        if !(self.map_offset <= offset && offset <= self.map_end()) {
            return Err(Error::programmer(format!(
                "clip offset {} is not inside range [{}, {})",
                offset,
                self.map_offset,
                self.map_end()
            )));
        }
        let adjustment = self.map_end() - offset;
        Ok(MapRange {
            length: self.length - adjustment,
            ..*self
        })
    }

    fn serialize(&self) -> Vec<u8> {
        MapPoint {
            map_offset: self.map_offset,
            target_offset: self.target_offset,
            length: self.length,
            target_id: self.target_id,
        }
        .pack()
    }

    fn from_serialized(data: &[u8]) -> Result<MapRange> {
        let point = MapPoint::unpack(data)?;
        Ok(MapRange {
            map_offset: point.map_offset,
            target_offset: point.target_offset,
            length: point.length,
            target_id: point.target_id,
        })
    }
}

pub struct MapStream {
    urn: Urn,
    pub targets: Vec<Urn>,
    target_idx: HashMap<String, u32>,
    tree: BTreeMap<u64, MapRange>,
    last_target: Option<Urn>,
    readptr: u64,
    dirty: bool,
}

impl MapStream {
    /// Register a new map contained in `volume_urn` and open it.
    pub fn create<'r>(
        resolver: &'r Resolver,
        map_urn: &Urn,
        volume_urn: &Urn,
    ) -> Result<ObjectGuard<'r>> {
        {
            let volume = resolver.open(volume_urn)?;
            let mut object = volume.borrow_mut();
            object.as_volume()?.children.insert(map_urn.clone());
        }

        resolver.set(
            map_urn,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(Urn::new(lexicon::AFF4_MAP_TYPE)),
        );
        resolver.set(
            map_urn,
            lexicon::AFF4_STORED,
            RdfValue::Urn(volume_urn.clone()),
        );

        resolver.open(map_urn)
    }

    /// Parse the map out of its `map`/`idx` segments. A map with no
    /// persisted segments starts empty.
    pub fn load(resolver: &Resolver, urn: &Urn) -> Result<Self> {
        let mut map = Self {
            urn: urn.clone(),
            targets: Vec::new(),
            target_idx: HashMap::new(),
            tree: BTreeMap::new(),
            last_target: None,
            readptr: 0,
            dirty: false,
        };

        let idx_urn = urn.append("idx");
        if let Ok(idx) = resolver.open(&idx_urn) {
            let mut object = idx.borrow_mut();
            let size = object.size(resolver)? as usize;
            let data = object.read(resolver, size)?;
            for line in String::from_utf8_lossy(&data).lines() {
                if line.is_empty() {
                    continue;
                }
                let target = Urn::new(line);
                map.target_idx
                    .insert(target.to_string(), map.targets.len() as u32);
                map.targets.push(target);
            }
        }

        let map_urn = urn.append("map");
        if let Ok(points) = resolver.open(&map_urn) {
            let mut object = points.borrow_mut();
            let size = object.size(resolver)? as usize;
            let data = object.read(resolver, size)?;
            for record in data.chunks_exact(MapPoint::SIZE) {
                let range = MapRange::from_serialized(record)?;
                if range.length > 0 {
                    map.tree.insert(range.map_offset, range);
                }
            }
        }

        Ok(map)
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
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

    /// The end of the highest mapped range.
    pub fn size(&self) -> u64 {
        self.tree
            .values()
            .next_back()
            .map(|range| range.map_end())
            .unwrap_or(0)
    }

    /// All ranges in ascending logical order.
    pub fn get_ranges(&self) -> Vec<MapRange> {
        self.tree.values().copied().collect()
    }

    pub fn clear(&mut self) {
        self.targets.clear();
        self.target_idx.clear();
        self.tree.clear();
        self.last_target = None;
    }

    fn target_id_for(&mut self, target: &Urn) -> u32 {
        if let Some(&id) = self.target_idx.get(target.as_str()) {
            return id;
        }
        let id = self.targets.len() as u32;
        self.target_idx.insert(target.to_string(), id);
        self.targets.push(target.clone());
        id
    }

    /// The range containing the logical offset, if any.
    fn find_containing(&self, offset: u64) -> Option<MapRange> {
        let (_, range) = self.tree.range(..=offset).next_back()?;
        if range.map_end() > offset {
            Some(*range)
        } else {
            None
        }
    }

    /// Add a new mapping range, merging with touching neighbors where the
    /// translation allows, clipping them where it does not, and discarding
    /// anything the new range envelops.
    pub fn add_range(
        &mut self,
        map_offset: u64,
        target_offset: u64,
        length: u64,
        target: &Urn,
    ) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.last_target = Some(target.clone());
        let target_id = self.target_id_for(target);

        let mut range = MapRange {
            map_offset,
            target_offset,
            length,
            target_id,
        };

        let mut stale: Vec<u64> = Vec::new();
        let mut clipped: Vec<MapRange> = Vec::new();

        // Left neighbor: the range whose right edge touches ours.
        if range.map_offset > 0 {
            if let Some(left) = self.find_containing(range.map_offset - 1) {
                if let Some(merged) = range.merge(&left) {
                    range = merged;
                    stale.push(left.map_offset);
                } else {
                    let trimmed = left.right_clip(range.map_offset)?;
                    if trimmed != left {
                        stale.push(left.map_offset);
                        if trimmed.length > 0 {
                            clipped.push(trimmed);
                        }
                    }
                }
            }
        }

        // Right neighbor: the range whose left edge touches our right end.
        if let Some(right) = self.find_containing(range.map_end()) {
            if let Some(merged) = range.merge(&right) {
                range = merged;
                if !stale.contains(&right.map_offset) {
                    stale.push(right.map_offset);
                }
            } else {
                let trimmed = right.left_clip(range.map_end())?;
                if trimmed != right {
                    if !stale.contains(&right.map_offset) {
                        stale.push(right.map_offset);
                    }
                    if trimmed.length > 0 {
                        clipped.push(trimmed);
                    }
                }
            }
        }

        for key in stale {
            self.tree.remove(&key);
        }
        for part in clipped {
            self.tree.insert(part.map_offset, part);
        }

        // Drop every range the new one envelops.
        let enveloped: Vec<u64> = self
            .tree
            .range(range.map_offset..range.map_end())
            .map(|(key, _)| *key)
            .collect();
        for key in enveloped {
            self.tree.remove(&key);
        }

        self.tree.insert(range.map_offset, range);
        self.dirty = true;
        Ok(())
    }

    /// Read across the mapped ranges, zero-padding gaps. An unreachable
    /// target pads its span with zeros rather than failing, because
    /// evidence maps may reference streams that are not present.
    pub fn read(&mut self, resolver: &Resolver, length: usize) -> Result<Vec<u8>> {
        let mut result: Vec<u8> = Vec::with_capacity(length);
        let window_end = self.readptr + length as u64;

        let mut intersecting: Vec<MapRange> = Vec::new();
        if let Some(first) = self.find_containing(self.readptr) {
            intersecting.push(first);
        }
        if self.readptr + 1 < window_end {
            for (_, range) in self.tree.range(self.readptr + 1..window_end) {
                intersecting.push(*range);
            }
        }

        for range in intersecting {
            let remaining = length - result.len();
            if remaining == 0 {
                break;
            }

            if range.map_offset > self.readptr {
                let padding = (remaining as u64).min(range.map_offset - self.readptr) as usize;
                result.resize(result.len() + padding, 0);
                self.readptr += padding as u64;
                if result.len() == length {
                    break;
                }
            }

            let remaining = length - result.len();
            let to_read = (remaining as u64).min(range.map_end() - self.readptr) as usize;
            let target = self.targets[range.target_id as usize].clone();

            match resolver.open(&target) {
                Ok(guard) => {
                    let mut stream = guard.borrow_mut();
                    stream.set_readptr(range.target_offset_at(self.readptr));
                    let mut data = stream.read(resolver, to_read)?;
                    data.resize(to_read, 0);
                    result.extend_from_slice(&data);
                }
                Err(_) => {
                    result.resize(result.len() + to_read, 0);
                }
            }
            self.readptr += to_read as u64;
        }

        if result.is_empty() {
            return Ok(vec![0u8; length]);
        }
        Ok(result)
    }

    /// Append-style write: data lands at the end of the backing stream and
    /// a range covering it is added at the current logical position.
    pub fn write(&mut self, resolver: &Resolver, data: &[u8]) -> Result<usize> {
        self.dirty = true;

        let target = self.get_backing_stream(resolver)?;
        let guard = resolver.open(&target)?;
        let mut stream = guard.borrow_mut();
        let end = stream.size(resolver)?;

        self.add_range(self.readptr, end, data.len() as u64, &target)?;

        stream.set_readptr(end);
        stream.write(resolver, data)?;
        self.readptr += data.len() as u64;
        Ok(data.len())
    }

    /// The URN of the backing data stream, creating one on first use. With
    /// `stored` compression a native volume member is used; otherwise a
    /// bevy image stream.
    pub fn get_backing_stream(&mut self, resolver: &Resolver) -> Result<Urn> {
        let target = if self.targets.is_empty() {
            self.urn.append("data")
        } else {
            self.last_target
                .clone()
                .unwrap_or_else(|| self.targets[self.targets.len() - 1].clone())
        };

        if resolver.open(&target).is_ok() {
            return Ok(target);
        }

        let volume_urn = stored_volume(resolver, &self.urn).ok_or_else(|| {
            Error::not_found(format!("unable to find storage for {}", self.urn))
        })?;

        let compression = resolver
            .get(&target, lexicon::AFF4_IMAGE_COMPRESSION)
            .map(|value| value.serialize());
        tracing::info!(
            "Stream will be compressed with {}",
            compression
                .as_deref()
                .unwrap_or(lexicon::AFF4_IMAGE_COMPRESSION_ZLIB)
        );

        if compression.as_deref() == Some(lexicon::AFF4_IMAGE_COMPRESSION_STORED) {
            let volume = resolver.open(&volume_urn)?;
            let mut object = volume.borrow_mut();
            object.as_volume()?.create_member(resolver, &target)?;
        } else {
            ImageStream::create(resolver, &target, &volume_urn)?;
        }
        Ok(target)
    }

    /// Copy a non-map source wholesale into the backing stream, recording
    /// a single range covering exactly the bytes written (the rest of the
    /// logical range stays unmapped and reads as zeros).
    pub fn write_stream(
        &mut self,
        resolver: &Resolver,
        source: &mut dyn Read,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        self.dirty = true;
        let backing = self.get_backing_stream(resolver)?;

        let guard = resolver.open(&backing)?;
        let mut stream = guard.borrow_mut();
        let start = stream.size(resolver)?;
        stream.set_readptr(start);

        let mut copied = 0u64;
        let mut buffer = vec![0u8; COPY_BUFFER];
        loop {
            let count = source.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            stream.write(resolver, &buffer[..count])?;
            copied += count as u64;
            progress.report(copied)?;
        }
        drop(stream);

        self.add_range(0, start, copied, &backing)
    }

    /// Copy another map: one destination range per source range, each
    /// pointing into our backing data stream, with the source bytes pulled
    /// from their upstream targets.
    pub fn write_stream_from_map(
        &mut self,
        resolver: &Resolver,
        source_map: &Urn,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let (source_ranges, source_targets) = {
            let guard = resolver.open(source_map)?;
            let mut object = guard.borrow_mut();
            let map = object.as_map()?;
            (map.get_ranges(), map.targets.clone())
        };
        if source_ranges.is_empty() {
            return Err(Error::programmer(
                "source map is empty in write_stream".to_string(),
            ));
        }

        self.dirty = true;
        let backing = self.get_backing_stream(resolver)?;
        let mut data_offset = {
            let guard = resolver.open(&backing)?;
            let size = guard.borrow().size(resolver)?;
            size
        };

        let mut total_copied = 0u64;
        for range in source_ranges {
            self.add_range(range.map_offset, data_offset, range.length, &backing)?;

            let target = source_targets[range.target_id as usize].clone();
            let source_guard = resolver.open(&target)?;
            let backing_guard = resolver.open(&backing)?;
            let mut source_stream = source_guard.borrow_mut();
            let mut backing_stream = backing_guard.borrow_mut();

            source_stream.set_readptr(range.target_offset);
            backing_stream.set_readptr(data_offset);

            let mut remaining = range.length;
            while remaining > 0 {
                let wanted = remaining.min(COPY_BUFFER as u64) as usize;
                let mut block = source_stream.read(resolver, wanted)?;
                if block.is_empty() {
                    break;
                }
                block.truncate(wanted);
                backing_stream.write(resolver, &block)?;
                remaining -= block.len() as u64;
                total_copied += block.len() as u64;
                progress.report(total_copied)?;
            }
            data_offset += range.length;
        }
        Ok(())
    }

    /// Standalone flush: locate the owning volume and persist.
    pub fn flush(&mut self, resolver: &Resolver) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let volume_urn = stored_volume(resolver, &self.urn).ok_or_else(|| {
            Error::not_found(format!("unable to find storage for {}", self.urn))
        })?;
        let volume = resolver.open(&volume_urn)?;
        let mut object = volume.borrow_mut();
        self.flush_into(resolver, object.as_volume()?)
    }

    /// Persist `<map>/map` (serialized ranges in tree order) and
    /// `<map>/idx` (LF-separated target URNs).
    pub fn flush_into(&mut self, resolver: &Resolver, volume: &mut ZipVolume) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let mut points = Vec::with_capacity(self.tree.len() * MapPoint::SIZE);
        for range in self.tree.values() {
            points.extend_from_slice(&range.serialize());
        }
        volume.write_member(resolver, &self.urn.append("map"), &points, ZIP_STORED)?;

        let idx = self
            .targets
            .iter()
            .map(|target| target.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        volume.write_member(resolver, &self.urn.append("idx"), idx.as_bytes(), ZIP_STORED)?;

        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(value: &str) -> Urn {
        Urn::new(value)
    }

    fn empty_map() -> MapStream {
        MapStream {
            urn: urn("aff4://map"),
            targets: Vec::new(),
            target_idx: HashMap::new(),
            tree: BTreeMap::new(),
            last_target: None,
            readptr: 0,
            dirty: false,
        }
    }

    #[test]
    fn test_merge_overlapping_same_target() {
        let mut map = empty_map();
        map.add_range(0, 0, 100, &urn("aff4://a")).unwrap();
        map.add_range(10, 10, 100, &urn("aff4://a")).unwrap();

        let ranges = map.get_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].length, 110);
    }

    #[test]
    fn test_repeated_region_truncates_first() {
        let mut map = empty_map();
        map.add_range(0, 0, 100, &urn("aff4://a")).unwrap();
        map.add_range(50, 0, 100, &urn("aff4://a")).unwrap();

        let ranges = map.get_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].length, 50);
    }

    #[test]
    fn test_inserted_region_splits_into_three() {
        let mut map = empty_map();
        map.add_range(0, 0, 100, &urn("aff4://a")).unwrap();
        map.add_range(50, 0, 10, &urn("aff4://b")).unwrap();

        let ranges = map.get_ranges();
        assert_eq!(ranges.len(), 3);
        assert_eq!((ranges[0].length, ranges[0].target_id), (50, 0));
        assert_eq!((ranges[1].length, ranges[1].target_id), (10, 1));
        assert_eq!((ranges[2].length, ranges[2].target_id), (40, 0));

        // A covering range overwrites all of them.
        map.add_range(0, 0, 100, &urn("aff4://b")).unwrap();
        let ranges = map.get_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].length, 100);
        assert_eq!(ranges[0].target_id, 1);
    }

    #[test]
    fn test_contiguous_writes_merge() {
        let mut map = empty_map();
        for i in 0..4u64 {
            map.add_range(i * 10, 100 + i * 10, 10, &urn("aff4://a"))
                .unwrap();
        }

        let ranges = map.get_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].length, 40);
        assert_eq!(ranges[0].target_id, 0);
    }

    #[test]
    fn test_sparse_then_filled() {
        let mut map = empty_map();
        map.add_range(0, 100, 10, &urn("aff4://a")).unwrap();
        map.add_range(30, 130, 10, &urn("aff4://a")).unwrap();

        let ranges = map.get_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].length, 10);
        assert_eq!(ranges[1].map_offset, 30);

        // Filling the hole makes the image contiguous again.
        map.add_range(10, 110, 20, &urn("aff4://a")).unwrap();
        let ranges = map.get_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].length, 40);
    }

    #[test]
    fn test_size_is_end_of_last_range() {
        let mut map = empty_map();
        assert_eq!(map.size(), 0);
        map.add_range(50, 0, 26, &urn("aff4://a")).unwrap();
        assert_eq!(map.size(), 76);
    }

    #[test]
    fn test_different_translation_does_not_merge() {
        let mut map = empty_map();
        map.add_range(0, 0, 10, &urn("aff4://a")).unwrap();
        // Contiguous logically, but the target offset jumps.
        map.add_range(10, 50, 10, &urn("aff4://a")).unwrap();
        assert_eq!(map.get_ranges().len(), 2);
    }

    #[test]
    fn test_serialized_range_roundtrip() {
        let range = MapRange {
            map_offset: 1,
            target_offset: 2,
            length: 3,
            target_id: 4,
        };
        let parsed = MapRange::from_serialized(&range.serialize()).unwrap();
        assert_eq!(parsed, range);
        assert_eq!(MapPoint::SIZE, 28);
    }

    #[test]
    fn test_clip_bounds_are_programmer_errors() {
        let range = MapRange {
            map_offset: 10,
            target_offset: 0,
            length: 10,
            target_id: 0,
        };
        assert!(range.left_clip(5).is_err());
        assert!(range.right_clip(21).is_err());
        assert_eq!(range.left_clip(15).unwrap().length, 5);
        assert_eq!(range.right_clip(15).unwrap().length, 5);
    }

    use crate::zip::ZipVolume;
    use aff4_core::Lexicon;

    /// Build the canonical out-of-order map: write at 50, then at 0, then
    /// overwrite two bytes at 50.
    fn write_test_map(backing: &Urn) -> Urn {
        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );

        let volume = ZipVolume::create(&resolver, backing).unwrap();
        let volume_urn = volume.urn();
        let map_urn = volume_urn.append("image.dd");

        {
            let map = MapStream::create(&resolver, &map_urn, &volume_urn).unwrap();
            let mut object = map.borrow_mut();

            object.set_readptr(50);
            object
                .write(&resolver, b"XX - This is the position.")
                .unwrap();

            object.set_readptr(0);
            object
                .write(&resolver, b"00 - This is the position.")
                .unwrap();

            // Overwrite by writing the same range again.
            object.set_readptr(50);
            object.write(&resolver, b"50").unwrap();
        }

        drop(volume);
        resolver.flush().unwrap();
        map_urn
    }

    fn reopen(backing: &Urn) -> Resolver {
        let resolver = Resolver::new(Lexicon::Standard);
        let volume = ZipVolume::create(&resolver, backing).unwrap();
        drop(volume);
        resolver
    }

    #[test]
    fn test_map_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_filename(dir.path().join("map.aff4").to_str().unwrap());
        let map_urn = write_test_map(&backing);

        let resolver = reopen(&backing);
        let map = resolver.open(&map_urn).unwrap();
        let mut object = map.borrow_mut();

        let ranges = object.as_map().unwrap().get_ranges();
        assert_eq!(ranges.len(), 3);
        assert_eq!(
            (ranges[0].length, ranges[0].map_offset, ranges[0].target_offset),
            (26, 0, 26)
        );
        // The two overwritten bytes appended to the end of the target.
        assert_eq!(
            (ranges[1].length, ranges[1].map_offset, ranges[1].target_offset),
            (2, 50, 52)
        );
        assert_eq!(
            (ranges[2].length, ranges[2].map_offset, ranges[2].target_offset),
            (24, 52, 2)
        );
    }

    #[test]
    fn test_map_reads_dispatch_to_targets() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_filename(dir.path().join("mapread.aff4").to_str().unwrap());
        let map_urn = write_test_map(&backing);

        let resolver = reopen(&backing);
        let map = resolver.open(&map_urn).unwrap();
        let mut object = map.borrow_mut();

        object.set_readptr(50);
        assert_eq!(object.read(&resolver, 2).unwrap(), b"50");

        object.set_readptr(0);
        assert_eq!(object.read(&resolver, 2).unwrap(), b"00");

        // Reads outside the ranges zero-pad.
        object.set_readptr(48);
        assert_eq!(object.read(&resolver, 4).unwrap(), b"\x00\x0050");
    }

    #[test]
    fn test_map_read_of_unreachable_target_pads() {
        let mut map = empty_map();
        map.add_range(0, 0, 8, &urn("aff4://missing-target")).unwrap();

        let resolver = Resolver::default();
        map.set_readptr(0);
        assert_eq!(map.read(&resolver, 8).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn test_map_write_stream_covers_written_length_only() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_filename(dir.path().join("ws.aff4").to_str().unwrap());

        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            &backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        let volume_urn = volume.urn();
        let map_urn = volume_urn.append("stream.map");

        let payload = b"forensically sound payload".to_vec();
        {
            let map = MapStream::create(&resolver, &map_urn, &volume_urn).unwrap();
            let mut object = map.borrow_mut();
            let mut source = std::io::Cursor::new(payload.clone());
            object
                .as_map()
                .unwrap()
                .write_stream(&resolver, &mut source, &mut aff4_core::NoProgress)
                .unwrap();

            let ranges = object.as_map().unwrap().get_ranges();
            assert_eq!(ranges.len(), 1);
            assert_eq!(ranges[0].map_offset, 0);
            assert_eq!(ranges[0].length, payload.len() as u64);
        }
        drop(volume);
        resolver.flush().unwrap();

        // The data is only readable once the backing bevies are flushed.
        let resolver = reopen(&backing);
        let map = resolver.open(&map_urn).unwrap();
        let mut object = map.borrow_mut();
        object.set_readptr(0);
        assert_eq!(object.read(&resolver, payload.len()).unwrap(), payload);
    }

    #[test]
    fn test_map_copy_from_map_source() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Urn::from_filename(dir.path().join("copy.aff4").to_str().unwrap());
        let source_urn = write_test_map(&backing);

        // Append a destination map to the same container and copy.
        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            &backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("append"),
        );
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        let volume_urn = volume.urn();
        let dest_urn = volume_urn.append("copy.map");
        {
            let dest = MapStream::create(&resolver, &dest_urn, &volume_urn).unwrap();
            let mut object = dest.borrow_mut();
            object
                .as_map()
                .unwrap()
                .write_stream_from_map(&resolver, &source_urn, &mut aff4_core::NoProgress)
                .unwrap();

            // Same logical geometry as the source.
            assert_eq!(object.as_map().unwrap().size(), 76);
        }
        drop(volume);
        resolver.flush().unwrap();

        let resolver = reopen(&backing);
        let dest = resolver.open(&dest_urn).unwrap();
        let mut object = dest.borrow_mut();
        object.set_readptr(50);
        assert_eq!(object.read(&resolver, 2).unwrap(), b"50");
        object.set_readptr(0);
        assert_eq!(object.read(&resolver, 2).unwrap(), b"00");
    }
}
