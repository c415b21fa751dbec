//! On-disk ZIP64 structures
//!
//! Every size/offset field in the traditional records is saturated; the
//! real values live in the per-entry Zip64 extensible extra field.

use aff4_core::binary_record;

pub const ZIP_STORED: u16 = 0;
pub const ZIP_DEFLATE: u16 = 8;

/// Version needed to extract Zip64 archives.
pub const ZIP64_VERSION: u16 = 45;

binary_record! {
    /// Traditional end-of-central-directory record. The volume URN rides in
    /// the comment that follows it.
    pub struct EndCentralDirectory {
        magic: u32 = 0x0605_4b50,
        number_of_this_disk: u16,
        disk_with_cd: u16,
        total_entries_in_cd_on_disk: u16 = 0xFFFF,
        total_entries_in_cd: u16 = 0xFFFF,
        size_of_cd: u32 = 0xFFFF_FFFF,
        offset_of_cd: u32 = 0xFFFF_FFFF,
        comment_len: u16,
    }
}

binary_record! {
    /// Central directory file header (fixed part; filename, extra field and
    /// comment follow).
    pub struct CDFileHeader {
        magic: u32 = 0x0201_4b50,
        version_made_by: u16 = ZIP64_VERSION,
        version_needed: u16 = ZIP64_VERSION,
        flags: u16,
        compression_method: u16,
        dostime: u16,
        dosdate: u16,
        crc32: u32,
        compress_size: u32 = 0xFFFF_FFFF,
        file_size: u32 = 0xFFFF_FFFF,
        file_name_length: u16,
        extra_field_len: u16,
        file_comment_length: u16,
        disk_number_start: u16,
        internal_file_attr: u16,
        external_file_attr: u32 = 0o644 << 16,
        relative_offset_local_header: u32 = 0xFFFF_FFFF,
    }
}

binary_record! {
    /// Local file header (fixed part; filename and extra field follow).
    pub struct ZipFileHeader {
        magic: u32 = 0x0403_4b50,
        version: u16 = ZIP64_VERSION,
        flags: u16,
        compression_method: u16,
        lastmod_time: u16,
        lastmod_date: u16,
        crc32: u32,
        compress_size: u32 = 0xFFFF_FFFF,
        file_size: u32 = 0xFFFF_FFFF,
        file_name_length: u16,
        extra_field_len: u16,
    }
}

binary_record! {
    /// Zip64 extensible extra field as written into central directory
    /// entries (header id 1, 28 data bytes).
    pub struct Zip64FileHeaderExtensibleField {
        header_id: u16 = 1,
        data_size: u16 = 28,
        file_size: u64,
        compress_size: u64,
        relative_offset_local_header: u64,
        disk_number_start: u32,
    }
}

binary_record! {
    /// Zip64 extra field carried in local file headers (sizes only).
    pub struct Zip64LocalExtra {
        header_id: u16 = 1,
        data_size: u16 = 16,
        file_size: u64,
        compress_size: u64,
    }
}

binary_record! {
    /// Zip64 end-of-central-directory record.
    pub struct Zip64EndCD {
        magic: u32 = 0x0606_4b50,
        size_of_header: u64 = 44,
        version_made_by: u16 = ZIP64_VERSION,
        version_needed: u16 = ZIP64_VERSION,
        number_of_disk: u32,
        number_of_disk_with_cd: u32,
        number_of_entries_in_volume: u64,
        number_of_entries_in_total: u64,
        size_of_cd: u64,
        offset_of_cd: u64,
    }
}

binary_record! {
    /// Zip64 end-of-central-directory locator.
    pub struct Zip64CDLocator {
        magic: u32 = 0x0706_4b50,
        disk_with_cd: u32,
        offset_of_end_cd: u64,
        number_of_disks: u32 = 1,
    }
}

/// Parse a CD entry's extra field, overriding whichever of the three values
/// were saturated in the fixed header. Foreign archives only include the
/// saturated fields; our own writer always includes all of them.
pub fn parse_zip64_extra(
    extra: &[u8],
    file_size: &mut u64,
    compress_size: &mut u64,
    local_offset: &mut u64,
) {
    let mut index = 0;
    while index + 4 <= extra.len() {
        let tag = u16::from_le_bytes([extra[index], extra[index + 1]]);
        let size = u16::from_le_bytes([extra[index + 2], extra[index + 3]]) as usize;
        if tag == 1 {
            let mut cursor = index + 4;
            let mut take = |target: &mut u64, saturated: bool| {
                if saturated && cursor + 8 <= extra.len() {
                    *target =
                        u64::from_le_bytes(extra[cursor..cursor + 8].try_into().unwrap());
                    cursor += 8;
                }
            };
            take(file_size, *file_size == 0xFFFF_FFFF);
            take(compress_size, *compress_size == 0xFFFF_FFFF);
            take(local_offset, *local_offset == 0xFFFF_FFFF);
        }
        index += 4 + size;
    }
}
