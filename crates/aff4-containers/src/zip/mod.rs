//! The ZIP64 volume
//!
//! A writable, appendable ZIP64 archive tailored for very large forensic
//! volumes. Members are only ever appended; the central directory is
//! rewritten at the end of the backing store on every flush, so an archive
//! concatenated after arbitrary prefix data keeps working (all internal
//! offsets are relative to the archive origin, the *global offset*).

pub mod records;

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use aff4_core::lexicon;
use aff4_core::{Error, Lexicon, Progress, RdfValue, Result, Urn};

use crate::object::{AnyObject, ObjectGuard};
use crate::resolver::Resolver;

use self::records::{
    parse_zip64_extra, CDFileHeader, EndCentralDirectory, Zip64CDLocator, Zip64EndCD,
    Zip64FileHeaderExtensibleField, Zip64LocalExtra, ZipFileHeader, ZIP_DEFLATE,
    ZIP_STORED,
};

const LOCAL_MAGIC: u32 = 0x0403_4b50;
const CD_MAGIC: u32 = 0x0201_4b50;
const EOCD_MAGIC: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const ZIP64_EOCD_MAGIC: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_MAGIC: u32 = 0x0706_4b50;

/// Largest possible distance of the EOCD magic from the end of the file
/// (record size plus maximal comment).
const EOCD_SCAN_WINDOW: u64 = 65536 + 22;

const COPY_BUFFER: usize = 64 * 1024;

fn member_char_ok(byte: u8, slash_ok: bool) -> bool {
    let printable = (0x21..=0x7e).contains(&byte) || byte == b' ';
    if !printable {
        return false;
    }
    if b"!$\\:*%?\"<>|]".contains(&byte) {
        return false;
    }
    if !slash_ok && byte == b'/' {
        return false;
    }
    true
}

/// Map a URN to an archive member name: relative-path resolution against the
/// volume URN, then percent-escaping of unacceptable bytes.
pub fn member_name_for_urn(member: &Urn, base: &Urn, slash_ok: bool) -> String {
    let filename = base
        .relative_path(member)
        .unwrap_or_else(|| member.to_string());
    let filename = filename.strip_prefix('/').unwrap_or(&filename);

    let mut escaped = String::with_capacity(filename.len());
    for byte in filename.bytes() {
        if member_char_ok(byte, slash_ok) {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02x}", byte));
        }
    }
    escaped
}

/// Inverse of `member_name_for_urn`. A fully-qualified `aff4:` member is
/// treated as absolute.
pub fn urn_from_member_name(member: &str, base: &Urn) -> Urn {
    let bytes = member.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            if let Ok(byte) =
                u8::from_str_radix(&member[index + 1..index + 3], 16)
            {
                decoded.push(byte);
                index += 3;
                continue;
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }

    let decoded = String::from_utf8_lossy(&decoded).into_owned();
    if decoded.starts_with("aff4://") {
        return Urn::new(decoded);
    }
    base.append_quoted(&decoded, false)
}

/// Where an opened member's bytes live.
pub enum SegmentStorage {
    /// Materialized content (DEFLATE members, or members under construction).
    Buffer(Vec<u8>),
    /// A slice view of the backing file (STORED members).
    FileSlice {
        backing_urn: Urn,
        offset: u64,
        length: u64,
    },
}

/// One entry of the central directory.
#[derive(Debug, Clone)]
pub struct ZipInfo {
    pub local_offset: u64,
    pub crc32: u32,
    pub compress_size: u64,
    pub file_size: u64,
    pub compression_method: u16,
}

pub struct ZipVolume {
    urn: Urn,
    backing_urn: Urn,
    /// Segment URNs issued by this volume, flushed before finalization.
    pub children: BTreeSet<Urn>,
    members: BTreeMap<String, ZipInfo>,
    global_offset: u64,
    dirty: bool,
}

impl ZipVolume {
    /// Create or open the volume stored in `backing_urn` and return it from
    /// the object cache.
    pub fn create<'r>(resolver: &'r Resolver, backing_urn: &Urn) -> Result<ObjectGuard<'r>> {
        let volume_urn = Urn::new_unique();
        resolver.set(
            &volume_urn,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(Urn::new(lexicon::AFF4_ZIP_TYPE)),
        );
        resolver.set(
            &volume_urn,
            lexicon::AFF4_STORED,
            RdfValue::Urn(backing_urn.clone()),
        );
        resolver.open(&volume_urn)
    }

    pub fn load(resolver: &Resolver, urn: &Urn) -> Result<Self> {
        let backing_urn = resolver
            .get_urn(urn, lexicon::AFF4_STORED)
            .ok_or_else(|| Error::not_found(format!("unable to load backing urn for {}", urn)))?;

        let mut volume = Self {
            urn: urn.clone(),
            backing_urn: backing_urn.clone(),
            children: BTreeSet::new(),
            members: BTreeMap::new(),
            global_offset: 0,
            dirty: false,
        };

        {
            let backing = resolver.open(&backing_urn)?;
            let mut store = backing.borrow_mut();
            let size = store.size(resolver)?;
            volume.parse_footer(resolver, &mut store, size)?;
        }

        // Populate the resolver with every member we found.
        for name in volume.members.keys() {
            let member_urn = urn_from_member_name(name, &volume.urn);
            volume.register_member(resolver, &member_urn, volume.members[name].file_size);
        }

        if volume.members.contains_key(lexicon::AFF4_CONTAINER_INFO_TURTLE) {
            let turtle = volume.read_member(resolver, lexicon::AFF4_CONTAINER_INFO_TURTLE)?;
            resolver.load_from_turtle(&turtle)?;
        }

        Ok(volume)
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    pub fn backing_urn(&self) -> &Urn {
        &self.backing_urn
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn global_offset(&self) -> u64 {
        self.global_offset
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn member_info(&self, name: &str) -> Option<&ZipInfo> {
        self.members.get(name)
    }

    fn register_member(&self, resolver: &Resolver, member_urn: &Urn, size: u64) {
        resolver.set(
            member_urn,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(Urn::new(lexicon::AFF4_ZIP_SEGMENT_TYPE)),
        );
        resolver.set(
            member_urn,
            lexicon::AFF4_STORED,
            RdfValue::Urn(self.urn.clone()),
        );
        resolver.set(
            member_urn,
            lexicon::AFF4_STREAM_SIZE,
            RdfValue::Integer(size as i64),
        );
    }

    /// Locate the end-of-central-directory records and walk the central
    /// directory. Handles archives appended after arbitrary prefix data by
    /// computing the global offset.
    fn parse_footer(
        &mut self,
        resolver: &Resolver,
        backing: &mut AnyObject,
        size: u64,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let window = size.min(EOCD_SCAN_WINDOW);
        let tail = backing.read_at(resolver, size - window, window as usize)?;

        let eocd_in_tail = match tail
            .windows(EOCD_MAGIC.len())
            .rposition(|candidate| candidate == EOCD_MAGIC)
        {
            Some(position) => position as u64,
            None => {
                // Not a zip yet. Writable backing means we start a fresh
                // archive at the current end of the prefix data.
                let mode = resolver
                    .get_text(&self.backing_urn, lexicon::AFF4_STREAM_WRITE_MODE)
                    .unwrap_or_else(|| "read".to_string());
                if mode == "read" {
                    return Err(Error::format(format!(
                        "unable to find end of central directory in {}",
                        self.backing_urn
                    )));
                }
                self.global_offset = size;
                return Ok(());
            }
        };
        let eocd_offset = size - window + eocd_in_tail;

        let ecd = EndCentralDirectory::unpack(&tail[eocd_in_tail as usize..])?;
        let comment_start = eocd_in_tail as usize + EndCentralDirectory::SIZE;
        let comment = tail
            .get(comment_start..comment_start + ecd.comment_len as usize)
            .unwrap_or(&[]);

        // The current URN is stored in the zip comment.
        if !comment.is_empty() {
            let comment_urn = Urn::new(String::from_utf8_lossy(comment).into_owned());
            if comment_urn != self.urn {
                tracing::info!("Volume renamed to {}", comment_urn);
                resolver.rename_subject(&self.urn, &comment_urn);
                resolver.set(
                    &comment_urn,
                    lexicon::AFF4_STORED,
                    RdfValue::Urn(self.backing_urn.clone()),
                );
                self.urn = comment_urn;
            }
        }

        let (cd_real_offset, total_entries) = self.parse_end_records(backing, resolver, eocd_offset, &ecd)?;
        self.parse_central_directory(backing, resolver, cd_real_offset, total_entries)?;
        Ok(())
    }

    /// Resolve the real central directory position from either the Zip64
    /// records or (for foreign, small archives) the traditional EOCD, and
    /// compute the global offset.
    fn parse_end_records(
        &mut self,
        backing: &mut AnyObject,
        resolver: &Resolver,
        eocd_offset: u64,
        ecd: &EndCentralDirectory,
    ) -> Result<(u64, u64)> {
        if eocd_offset >= (Zip64CDLocator::SIZE + Zip64EndCD::SIZE) as u64 {
            let locator_offset = eocd_offset - Zip64CDLocator::SIZE as u64;
            let locator_bytes =
                backing.read_at(resolver, locator_offset, Zip64CDLocator::SIZE)?;
            let locator = Zip64CDLocator::unpack(&locator_bytes)?;

            if locator.magic == ZIP64_LOCATOR_MAGIC {
                let zip64_offset = locator_offset - Zip64EndCD::SIZE as u64;
                let zip64_bytes =
                    backing.read_at(resolver, zip64_offset, Zip64EndCD::SIZE)?;
                let zip64 = Zip64EndCD::unpack(&zip64_bytes)?;
                if zip64.magic != ZIP64_EOCD_MAGIC {
                    return Err(Error::format(
                        "invalid Zip64 end of central directory record".to_string(),
                    ));
                }

                let cd_real_offset = zip64_offset.checked_sub(zip64.size_of_cd).ok_or_else(
                    || Error::format("central directory size exceeds archive".to_string()),
                )?;
                self.global_offset =
                    cd_real_offset.checked_sub(zip64.offset_of_cd).ok_or_else(|| {
                        Error::format("central directory offset exceeds archive".to_string())
                    })?;
                tracing::debug!(
                    "Found Zip64 end of central directory, global offset {}",
                    self.global_offset
                );
                return Ok((cd_real_offset, zip64.number_of_entries_in_total));
            }
        }

        // No Zip64 records; a small archive from an implementation that
        // only writes them on demand.
        let cd_real_offset = eocd_offset
            .checked_sub(ecd.size_of_cd as u64)
            .ok_or_else(|| Error::format("central directory size exceeds archive".to_string()))?;
        self.global_offset = cd_real_offset
            .checked_sub(ecd.offset_of_cd as u64)
            .ok_or_else(|| Error::format("central directory offset exceeds archive".to_string()))?;
        Ok((cd_real_offset, ecd.total_entries_in_cd as u64))
    }

    fn parse_central_directory(
        &mut self,
        backing: &mut AnyObject,
        resolver: &Resolver,
        offset: u64,
        count: u64,
    ) -> Result<()> {
        let mut cursor = offset;
        for _ in 0..count {
            let header_bytes = backing.read_at(resolver, cursor, CDFileHeader::SIZE)?;
            let header = CDFileHeader::unpack(&header_bytes)?;
            if header.magic != CD_MAGIC {
                tracing::warn!("Central directory signature mismatch, stopping scan");
                break;
            }
            cursor += CDFileHeader::SIZE as u64;

            let name_bytes = backing.read_at(resolver, cursor, header.file_name_length as usize)?;
            let filename = String::from_utf8_lossy(&name_bytes).into_owned();
            cursor += header.file_name_length as u64;

            let extra = backing.read_at(resolver, cursor, header.extra_field_len as usize)?;
            cursor += header.extra_field_len as u64 + header.file_comment_length as u64;

            let mut file_size = header.file_size as u64;
            let mut compress_size = header.compress_size as u64;
            let mut local_offset = header.relative_offset_local_header as u64;
            parse_zip64_extra(&extra, &mut file_size, &mut compress_size, &mut local_offset);

            tracing::debug!("Found member {:?} at offset {}", filename, local_offset);
            self.members.insert(
                filename,
                ZipInfo {
                    local_offset,
                    crc32: header.crc32,
                    compress_size,
                    file_size,
                    compression_method: header.compression_method,
                },
            );
        }
        Ok(())
    }

    /// Open a member's payload, validating the local header on the way.
    /// STORED members become a slice view of the backing file, DEFLATE
    /// members are inflated into memory.
    fn open_member_storage(&self, resolver: &Resolver, name: &str) -> Result<SegmentStorage> {
        let entry = self
            .members
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no member {:?} in {}", name, self.urn)))?;

        let backing = resolver.open(&self.backing_urn)?;
        let mut store = backing.borrow_mut();

        let mut cursor = self.global_offset + entry.local_offset;
        let header_bytes = store.read_at(resolver, cursor, ZipFileHeader::SIZE)?;
        let header = ZipFileHeader::unpack(&header_bytes)?;
        if header.magic != LOCAL_MAGIC {
            return Err(Error::format(format!(
                "invalid local file header magic for member {:?}",
                name
            )));
        }
        cursor += ZipFileHeader::SIZE as u64;

        let stored_name = store.read_at(resolver, cursor, header.file_name_length as usize)?;
        if stored_name != name.as_bytes() {
            return Err(Error::format(format!(
                "local header name mismatch: expected {:?}, found {:?}",
                name,
                String::from_utf8_lossy(&stored_name)
            )));
        }
        cursor += header.file_name_length as u64 + header.extra_field_len as u64;

        match entry.compression_method {
            ZIP_STORED => Ok(SegmentStorage::FileSlice {
                backing_urn: self.backing_urn.clone(),
                offset: cursor,
                length: entry.compress_size,
            }),
            ZIP_DEFLATE => {
                let compressed =
                    store.read_at(resolver, cursor, entry.compress_size as usize)?;
                let mut inflated = Vec::with_capacity(entry.file_size as usize);
                DeflateDecoder::new(compressed.as_slice())
                    .read_to_end(&mut inflated)
                    .map_err(|e| {
                        Error::format(format!("unable to inflate member {:?}: {}", name, e))
                    })?;
                Ok(SegmentStorage::Buffer(inflated))
            }
            other => Err(Error::format(format!(
                "unsupported compression method {} for member {:?}",
                other, name
            ))),
        }
    }

    /// Read a member fully into memory.
    pub fn read_member(&self, resolver: &Resolver, name: &str) -> Result<Vec<u8>> {
        match self.open_member_storage(resolver, name)? {
            SegmentStorage::Buffer(data) => Ok(data),
            SegmentStorage::FileSlice {
                backing_urn,
                offset,
                length,
            } => {
                let backing = resolver.open(&backing_urn)?;
                let mut store = backing.borrow_mut();
                store.read_at(resolver, offset, length as usize)
            }
        }
    }

    /// Construct (without caching) the segment object for a member URN.
    pub(crate) fn load_segment(&self, resolver: &Resolver, urn: &Urn) -> Result<ZipSegment> {
        let name = member_name_for_urn(urn, &self.urn, true);
        let (storage, method) = match self.members.get(&name) {
            Some(entry) => (
                self.open_member_storage(resolver, &name)?,
                entry.compression_method,
            ),
            // AFF4 members may be created before any data exists.
            None => (SegmentStorage::Buffer(Vec::new()), ZIP_STORED),
        };

        Ok(ZipSegment {
            urn: urn.clone(),
            owner_urn: self.urn.clone(),
            storage,
            readptr: 0,
            dirty: false,
            compression_method: method,
        })
    }

    /// Return a cached, writable segment for a child URN, creating it on
    /// first use. The segment lives in memory until flush.
    pub fn create_member<'r>(
        &mut self,
        resolver: &'r Resolver,
        child: &Urn,
    ) -> Result<ObjectGuard<'r>> {
        let filename = member_name_for_urn(child, &self.urn, true);
        self.create_segment(resolver, &filename)
    }

    pub fn create_segment<'r>(
        &mut self,
        resolver: &'r Resolver,
        filename: &str,
    ) -> Result<ObjectGuard<'r>> {
        self.dirty = true;

        let segment_urn = urn_from_member_name(filename, &self.urn);
        if let Some(cached) = resolver.cache_get(&segment_urn) {
            return Ok(cached);
        }

        self.register_member(resolver, &segment_urn, 0);
        self.children.insert(segment_urn.clone());

        let segment = self.load_segment(resolver, &segment_urn)?;
        tracing::info!("Creating ZipFileSegment {}", segment_urn);
        resolver.cache_put(AnyObject::Segment(segment))
    }

    /// Open an existing member as a cached segment object.
    pub fn open_zip_segment<'r>(
        &self,
        resolver: &'r Resolver,
        filename: &str,
    ) -> Result<ObjectGuard<'r>> {
        let segment_urn = urn_from_member_name(filename, &self.urn);
        if let Some(cached) = resolver.cache_get(&segment_urn) {
            return Ok(cached);
        }
        if !self.members.contains_key(filename) {
            return Err(Error::not_found(format!(
                "no member {:?} in {}",
                filename, self.urn
            )));
        }
        self.register_member(resolver, &segment_urn, self.members[filename].file_size);
        let segment = self.load_segment(resolver, &segment_urn)?;
        resolver.cache_put(AnyObject::Segment(segment))
    }

    /// Append a complete member to the backing store.
    pub fn write_member(
        &mut self,
        resolver: &Resolver,
        member_urn: &Urn,
        data: &[u8],
        method: u16,
    ) -> Result<()> {
        let name = member_name_for_urn(member_urn, &self.urn, true);
        self.register_member(resolver, member_urn, data.len() as u64);
        self.write_member_raw(resolver, &name, data, method)
    }

    fn write_member_raw(
        &mut self,
        resolver: &Resolver,
        name: &str,
        data: &[u8],
        method: u16,
    ) -> Result<()> {
        let payload = match method {
            ZIP_STORED => std::borrow::Cow::Borrowed(data),
            ZIP_DEFLATE => std::borrow::Cow::Owned(deflate_bytes(data)?),
            other => {
                return Err(Error::format(format!(
                    "unsupported compression method {}",
                    other
                )))
            }
        };
        let crc32 = crc32fast::hash(data);

        let mut header = ZipFileHeader::new();
        header.crc32 = crc32;
        header.compression_method = method;
        header.file_name_length = name.len() as u16;
        header.extra_field_len = Zip64LocalExtra::SIZE as u16;

        let mut extra = Zip64LocalExtra::new();
        extra.file_size = data.len() as u64;
        extra.compress_size = payload.len() as u64;

        let mut record = header.pack();
        record.extend_from_slice(name.as_bytes());
        record.extend_from_slice(&extra.pack());
        record.extend_from_slice(&payload);

        let backing = resolver.open(&self.backing_urn)?;
        let mut store = backing.borrow_mut();
        let end = store.size(resolver)?;
        store.set_readptr(end);
        store.write(resolver, &record)?;

        self.members.insert(
            name.to_string(),
            ZipInfo {
                local_offset: end - self.global_offset,
                crc32,
                compress_size: payload.len() as u64,
                file_size: data.len() as u64,
                compression_method: method,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Write a member incrementally from a stream. The local header is
    /// appended with placeholder sizes and rewritten in place once the
    /// source is exhausted.
    pub fn stream_add_member(
        &mut self,
        resolver: &Resolver,
        member_urn: &Urn,
        source: &mut dyn Read,
        method: u16,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let name = member_name_for_urn(member_urn, &self.urn, true);

        let backing = resolver.open(&self.backing_urn)?;
        let mut store = backing.borrow_mut();
        let start = store.size(resolver)?;
        store.set_readptr(start);

        let mut header = ZipFileHeader::new();
        header.compression_method = method;
        header.file_name_length = name.len() as u16;
        header.extra_field_len = Zip64LocalExtra::SIZE as u16;

        let mut record = header.pack();
        record.extend_from_slice(name.as_bytes());
        record.extend_from_slice(&Zip64LocalExtra::new().pack());
        store.write(resolver, &record)?;

        let mut crc = crc32fast::Hasher::new();
        let mut file_size = 0u64;
        let mut buffer = vec![0u8; COPY_BUFFER];

        let compress_size = match method {
            ZIP_DEFLATE => {
                let mut encoder = DeflateEncoder::new(
                    CountingWriter {
                        store: &mut *store,
                        resolver,
                        written: 0,
                    },
                    Compression::default(),
                );
                loop {
                    let count = source.read(&mut buffer)?;
                    if count == 0 {
                        break;
                    }
                    crc.update(&buffer[..count]);
                    file_size += count as u64;
                    encoder.write_all(&buffer[..count])?;
                    progress.report(file_size)?;
                }
                encoder.finish()?.written
            }
            ZIP_STORED => {
                loop {
                    let count = source.read(&mut buffer)?;
                    if count == 0 {
                        break;
                    }
                    crc.update(&buffer[..count]);
                    file_size += count as u64;
                    store.write(resolver, &buffer[..count])?;
                    progress.report(file_size)?;
                }
                file_size
            }
            other => {
                return Err(Error::format(format!(
                    "unsupported compression method {}",
                    other
                )))
            }
        };

        // Rewrite the local header in place with the final values.
        let end = store.tell();
        let crc32 = crc.finalize();
        header.crc32 = crc32;
        let mut extra = Zip64LocalExtra::new();
        extra.file_size = file_size;
        extra.compress_size = compress_size;

        let mut record = header.pack();
        record.extend_from_slice(name.as_bytes());
        record.extend_from_slice(&extra.pack());
        store.set_readptr(start);
        store.write(resolver, &record)?;
        store.set_readptr(end);
        drop(store);

        self.register_member(resolver, member_urn, file_size);
        self.members.insert(
            name,
            ZipInfo {
                local_offset: start - self.global_offset,
                crc32,
                compress_size,
                file_size,
                compression_method: method,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Flush every cached child we own, then emit `information.turtle` and
    /// the central directory.
    pub fn flush(&mut self, resolver: &Resolver) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let children = std::mem::take(&mut self.children);
        for child in children {
            let guard = match resolver.cache_get(&child) {
                Some(guard) => guard,
                None => continue,
            };
            let mut object = guard.borrow_mut();
            match &mut *object {
                AnyObject::Segment(segment) => segment.flush_into(resolver, self)?,
                AnyObject::Image(image) => image.flush_into(resolver, self)?,
                AnyObject::Map(map) => map.flush_into(resolver, self)?,
                _ => {}
            }
        }

        if resolver.lexicon() == Lexicon::Standard
            && !self.members.contains_key(lexicon::AFF4_CONTAINER_VERSION_TXT)
        {
            let version = format!(
                "major=1\nminor=0\ntool=aff4-rs {}\n",
                env!("CARGO_PKG_VERSION")
            );
            self.write_member_raw(
                resolver,
                lexicon::AFF4_CONTAINER_VERSION_TXT,
                version.as_bytes(),
                ZIP_STORED,
            )?;
        }

        if !self
            .members
            .contains_key(lexicon::AFF4_CONTAINER_DESCRIPTION)
        {
            let description = self.urn.to_string();
            self.write_member_raw(
                resolver,
                lexicon::AFF4_CONTAINER_DESCRIPTION,
                description.as_bytes(),
                ZIP_STORED,
            )?;
        }

        let turtle = resolver.dump_turtle_bytes(false)?;
        self.write_member_raw(
            resolver,
            lexicon::AFF4_CONTAINER_INFO_TURTLE,
            &turtle,
            ZIP_DEFLATE,
        )?;

        self.write_central_directory(resolver)?;
        self.dirty = false;
        Ok(())
    }

    /// Concatenate the central directory, the Zip64 records and the
    /// traditional EOCD (whose comment carries the volume URN) and append
    /// them in one write.
    fn write_central_directory(&mut self, resolver: &Resolver) -> Result<()> {
        let mut directory = Vec::new();
        for (name, info) in &self.members {
            let mut header = CDFileHeader::new();
            header.compression_method = info.compression_method;
            header.crc32 = info.crc32;
            header.file_name_length = name.len() as u16;
            header.extra_field_len = Zip64FileHeaderExtensibleField::SIZE as u16;
            directory.extend_from_slice(&header.pack());
            directory.extend_from_slice(name.as_bytes());

            let mut extra = Zip64FileHeaderExtensibleField::new();
            extra.file_size = info.file_size;
            extra.compress_size = info.compress_size;
            extra.relative_offset_local_header = info.local_offset;
            directory.extend_from_slice(&extra.pack());
        }

        let backing = resolver.open(&self.backing_urn)?;
        let mut store = backing.borrow_mut();
        let end = store.size(resolver)?;
        let cd_offset = end - self.global_offset;

        let mut footer = directory;
        let cd_size = footer.len() as u64;

        let mut zip64 = Zip64EndCD::new();
        zip64.number_of_entries_in_volume = self.members.len() as u64;
        zip64.number_of_entries_in_total = self.members.len() as u64;
        zip64.size_of_cd = cd_size;
        zip64.offset_of_cd = cd_offset;
        footer.extend_from_slice(&zip64.pack());

        let mut locator = Zip64CDLocator::new();
        locator.offset_of_end_cd = cd_offset + cd_size;
        footer.extend_from_slice(&locator.pack());

        let comment = self.urn.to_string();
        let mut ecd = EndCentralDirectory::new();
        ecd.comment_len = comment.len() as u16;
        footer.extend_from_slice(&ecd.pack());
        footer.extend_from_slice(comment.as_bytes());

        store.set_readptr(end);
        store.write(resolver, &footer)?;
        Ok(())
    }
}

/// Raw-deflate a buffer (ZIP member compression, no zlib wrapper).
fn deflate_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

struct CountingWriter<'a, 'r> {
    store: &'a mut AnyObject,
    resolver: &'r Resolver,
    written: u64,
}

impl Write for CountingWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.store
            .write(self.resolver, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A single archive member. In-memory until flush; STORED members opened
/// from disk stay a slice view until first written.
pub struct ZipSegment {
    urn: Urn,
    owner_urn: Urn,
    storage: SegmentStorage,
    readptr: u64,
    dirty: bool,
    compression_method: u16,
}

impl ZipSegment {
    pub fn load(resolver: &Resolver, urn: &Urn) -> Result<Self> {
        let owner_urn = resolver
            .get_urn(urn, lexicon::AFF4_STORED)
            .ok_or_else(|| Error::not_found(format!("no owner volume for segment {}", urn)))?;
        let owner = resolver.open(&owner_urn)?;
        let mut object = owner.borrow_mut();
        let volume = object.as_volume()?;
        volume.load_segment(resolver, urn)
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

    /// Use DEFLATE when this segment is flushed.
    pub fn set_compression(&mut self, method: u16) {
        self.compression_method = method;
    }

    pub fn size(&self) -> u64 {
        match &self.storage {
            SegmentStorage::Buffer(data) => data.len() as u64,
            SegmentStorage::FileSlice { length, .. } => *length,
        }
    }

    pub fn read(&mut self, resolver: &Resolver, length: usize) -> Result<Vec<u8>> {
        let result = match &self.storage {
            SegmentStorage::Buffer(data) => {
                let start = (self.readptr as usize).min(data.len());
                let end = start.saturating_add(length).min(data.len());
                data[start..end].to_vec()
            }
            SegmentStorage::FileSlice {
                backing_urn,
                offset,
                length: slice_len,
            } => {
                let remaining = slice_len.saturating_sub(self.readptr) as usize;
                let wanted = length.min(remaining);
                if wanted == 0 {
                    Vec::new()
                } else {
                    let backing = resolver.open(backing_urn)?;
                    let mut store = backing.borrow_mut();
                    store.read_at(resolver, offset + self.readptr, wanted)?
                }
            }
        };
        self.readptr += result.len() as u64;
        Ok(result)
    }

    fn materialize(&mut self, resolver: &Resolver) -> Result<&mut Vec<u8>> {
        if let SegmentStorage::FileSlice {
            backing_urn,
            offset,
            length,
        } = &self.storage
        {
            let backing = resolver.open(backing_urn)?;
            let mut store = backing.borrow_mut();
            let data = store.read_at(resolver, *offset, *length as usize)?;
            drop(store);
            self.storage = SegmentStorage::Buffer(data);
        }
        match &mut self.storage {
            SegmentStorage::Buffer(data) => Ok(data),
            SegmentStorage::FileSlice { .. } => unreachable!("storage just materialized"),
        }
    }

    pub fn write(&mut self, resolver: &Resolver, data: &[u8]) -> Result<usize> {
        self.dirty = true;
        let readptr = self.readptr as usize;
        let buffer = self.materialize(resolver)?;
        if readptr > buffer.len() {
            buffer.resize(readptr, 0);
        }
        let overlap = (buffer.len() - readptr).min(data.len());
        buffer[readptr..readptr + overlap].copy_from_slice(&data[..overlap]);
        buffer.extend_from_slice(&data[overlap..]);
        self.readptr += data.len() as u64;
        Ok(data.len())
    }

    pub fn truncate(&mut self) {
        self.storage = SegmentStorage::Buffer(Vec::new());
        self.readptr = 0;
        self.dirty = true;
    }

    /// Standalone flush: locate the owner volume and append our content.
    pub fn flush(&mut self, resolver: &Resolver) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let owner_urn = self.owner_urn.clone();
        let owner = resolver.open(&owner_urn)?;
        let mut object = owner.borrow_mut();
        let volume = object.as_volume()?;
        self.flush_into(resolver, volume)
    }

    /// Flush driven by the owning volume (no re-open of the volume).
    pub fn flush_into(&mut self, resolver: &Resolver, volume: &mut ZipVolume) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let data = match &self.storage {
            SegmentStorage::Buffer(data) => data.clone(),
            SegmentStorage::FileSlice { .. } => self.materialize(resolver)?.clone(),
        };
        volume.write_member(resolver, &self.urn, &data, self.compression_method)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    #[test]
    fn test_member_name_escaping() {
        let volume = Urn::new("aff4://0a4bbdea-e768-4876-9ba2-09f24274d9e4");
        let segment = volume.append("Foobar.txt");
        assert_eq!(
            member_name_for_urn(&segment, &volume, true),
            "Foobar.txt"
        );

        let nasty = volume.append_quoted("a:b?c", false);
        let escaped = member_name_for_urn(&nasty, &volume, true);
        assert_eq!(escaped, "a%3ab%3fc");
    }

    #[test]
    fn test_member_name_for_unrelated_urn() {
        let volume = Urn::new("aff4://volume");
        let foreign = Urn::new("aff4://other/stream");
        let escaped = member_name_for_urn(&foreign, &volume, true);
        assert!(escaped.starts_with("aff4%3a//"));

        let roundtrip = urn_from_member_name(&escaped, &volume);
        assert_eq!(roundtrip, foreign);
    }

    #[test]
    fn test_urn_from_member_name_relative() {
        let volume = Urn::new("aff4://volume");
        let urn = urn_from_member_name("image.dd/00000000", &volume);
        assert_eq!(urn.as_str(), "aff4://volume/image.dd/00000000");
    }

    #[test]
    fn test_urn_roundtrip_with_escapes() {
        let volume = Urn::new("aff4://volume");
        let member = volume.append_quoted("weird:name", false);
        let name = member_name_for_urn(&member, &volume, true);
        assert_eq!(urn_from_member_name(&name, &volume), member);
    }

    fn temp_backing(dir: &tempfile::TempDir, name: &str) -> Urn {
        Urn::from_filename(dir.path().join(name).to_str().unwrap())
    }

    #[test]
    fn test_segment_write_append_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let backing = temp_backing(&dir, "test.aff4");
        let data1: &[u8] = b"I am a segment!";
        let data2: &[u8] = b"I am another segment!";

        let volume_urn;
        {
            let resolver = Resolver::new(Lexicon::Standard);
            resolver.set(
                &backing,
                lexicon::AFF4_STREAM_WRITE_MODE,
                RdfValue::from("truncate"),
            );

            let volume = ZipVolume::create(&resolver, &backing).unwrap();
            volume_urn = volume.urn();
            let segment_urn = volume_urn.append("Foobar.txt");

            {
                let segment = volume
                    .borrow_mut()
                    .as_volume()
                    .unwrap()
                    .create_member(&resolver, &segment_urn)
                    .unwrap();
                segment.borrow_mut().write(&resolver, data1).unwrap();
            }

            // A second create returns the same cached segment; appending
            // extends it.
            {
                let segment = volume
                    .borrow_mut()
                    .as_volume()
                    .unwrap()
                    .create_member(&resolver, &segment_urn)
                    .unwrap();
                let mut object = segment.borrow_mut();
                object.seek(&resolver, SeekFrom::End(0)).unwrap();
                object.write(&resolver, data2).unwrap();
            }

            drop(volume);
            resolver.flush().unwrap();
        }

        // Reopen with a fresh resolver: the comment renames the volume and
        // the segment yields the concatenation.
        let resolver = Resolver::new(Lexicon::Standard);
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        assert_eq!(volume.urn(), volume_urn);
        let segment_urn = volume.urn().append("Foobar.txt");
        drop(volume);

        let segment = resolver.open(&segment_urn).unwrap();
        let content = segment.borrow_mut().read(&resolver, 1000).unwrap();
        let mut expected = data1.to_vec();
        expected.extend_from_slice(data2);
        assert_eq!(content, expected);
    }

    #[test]
    fn test_volume_written_appendable_after_prefix() {
        // An archive appended after arbitrary prefix data loads through the
        // global offset.
        let dir = tempfile::tempdir().unwrap();
        let backing = temp_backing(&dir, "prefixed.aff4");
        std::fs::write(backing.to_filename().unwrap(), b"GARBAGE PREFIX DATA").unwrap();

        let volume_urn;
        {
            let resolver = Resolver::new(Lexicon::Standard);
            resolver.set(
                &backing,
                lexicon::AFF4_STREAM_WRITE_MODE,
                RdfValue::from("append"),
            );
            let volume = ZipVolume::create(&resolver, &backing).unwrap();
            volume_urn = volume.urn();
            {
                let mut object = volume.borrow_mut();
                let zip = object.as_volume().unwrap();
                assert_eq!(zip.global_offset(), 19);
                zip.write_member(
                    &resolver,
                    &volume_urn.append("payload"),
                    b"evidence bytes",
                    ZIP_STORED,
                )
                .unwrap();
            }
            drop(volume);
            resolver.flush().unwrap();
        }

        let resolver = Resolver::new(Lexicon::Standard);
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        {
            let mut object = volume.borrow_mut();
            let zip = object.as_volume().unwrap();
            assert_eq!(zip.global_offset(), 19);
            assert_eq!(
                zip.read_member(&resolver, "payload").unwrap(),
                b"evidence bytes"
            );
        }
    }

    #[test]
    fn test_deflate_member_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backing = temp_backing(&dir, "deflate.aff4");
        let body = vec![b'A'; 4096];

        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            &backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        let member = volume.urn().append("compressed.bin");
        {
            let mut object = volume.borrow_mut();
            let zip = object.as_volume().unwrap();
            zip.write_member(&resolver, &member, &body, records::ZIP_DEFLATE)
                .unwrap();
            let info = zip.member_info("compressed.bin").unwrap();
            assert!(info.compress_size < info.file_size);
            assert_eq!(zip.read_member(&resolver, "compressed.bin").unwrap(), body);
        }
    }

    #[test]
    fn test_stream_add_member_rewrites_header() {
        let dir = tempfile::tempdir().unwrap();
        let backing = temp_backing(&dir, "streamed.aff4");
        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            &backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        let member = volume.urn().append("streamed.bin");
        {
            let mut object = volume.borrow_mut();
            let zip = object.as_volume().unwrap();
            let mut source = std::io::Cursor::new(body.clone());
            zip.stream_add_member(
                &resolver,
                &member,
                &mut source,
                records::ZIP_DEFLATE,
                &mut aff4_core::NoProgress,
            )
            .unwrap();

            let info = zip.member_info("streamed.bin").unwrap();
            assert_eq!(info.file_size, body.len() as u64);
            assert_eq!(info.crc32, crc32fast::hash(&body));
            assert_eq!(zip.read_member(&resolver, "streamed.bin").unwrap(), body);
        }
    }

    #[test]
    fn test_missing_member_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backing = temp_backing(&dir, "empty.aff4");

        let resolver = Resolver::new(Lexicon::Standard);
        resolver.set(
            &backing,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );
        let volume = ZipVolume::create(&resolver, &backing).unwrap();
        let mut object = volume.borrow_mut();
        let zip = object.as_volume().unwrap();
        assert!(matches!(
            zip.read_member(&resolver, "absent"),
            Err(Error::NotFound(_))
        ));
    }
}
