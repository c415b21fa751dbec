//! The AFF4 lexicon
//!
//! URN vocabulary shared by every AFF4 generation, plus the three dialect
//! tables (standard, pre-standard "legacy" Evimetry, Scudette/Rekall) that
//! select which predicate and type names a given container uses.

/// This is the version of the AFF4 specification we support - not the
/// library version itself.
pub const AFF4_VERSION: &str = "1.0";

pub const AFF4_MAX_READ_LEN: u64 = 1024 * 1024 * 100;

pub const AFF4_NAMESPACE: &str = "http://aff4.org/Schema#";
pub const AFF4_LEGACY_NAMESPACE: &str = "http://afflib.org/2009/aff4#";
pub const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema#";
pub const RDF_NAMESPACE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
pub const AFF4_MEMORY_NAMESPACE: &str = "http://aff4.org/Schema#memory/";
pub const AFF4_DISK_NAMESPACE: &str = "http://aff4.org/Schema#disk/";

/// Attributes in this namespace are never written to persistent storage.
/// They carry in-process metadata about an AFF4 object only.
pub const AFF4_VOLATILE_NAMESPACE: &str = "http://aff4.org/VolatileSchema#";

// Each container carries this member which holds the URN of the container.
pub const AFF4_CONTAINER_DESCRIPTION: &str = "container.description";
pub const AFF4_CONTAINER_INFO_TURTLE: &str = "information.turtle";
pub const AFF4_CONTAINER_INFO_YAML: &str = "information.yaml";
pub const AFF4_CONTAINER_VERSION_TXT: &str = "version.txt";

// Attribute names for different AFF4 objects.
// Base AFF4Object
pub const AFF4_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const AFF4_STORED: &str = "http://aff4.org/Schema#stored";
pub const AFF4_CONTAINS: &str = "http://aff4.org/Schema#contains";

// AFF4 ZipFile containers.
pub const AFF4_ZIP_TYPE: &str = "http://aff4.org/Schema#zip_volume";
pub const AFF4_ZIP_SEGMENT_TYPE: &str = "http://aff4.org/Schema#zip_segment";

// AFF4Stream
pub const AFF4_STREAM_SIZE: &str = "http://aff4.org/Schema#size";
pub const AFF4_LEGACY_STREAM_SIZE: &str = "http://afflib.org/2009/aff4#size";

/// The original filename the stream had.
pub const AFF4_STREAM_ORIGINAL_FILENAME: &str =
    "http://aff4.org/Schema#original_filename";

/// Can be "read", "truncate", "append". Volatile.
pub const AFF4_STREAM_WRITE_MODE: &str = "http://aff4.org/VolatileSchema#writable";

// FileBackedObjects are either marked explicitly or using the file:// scheme.
pub const AFF4_FILE_TYPE: &str = "http://aff4.org/Schema#file";

/// file:// based URNs do not always have a direct mapping to filesystem
/// paths. This volatile attribute overrides the filename mapping.
pub const AFF4_FILE_NAME: &str = "http://aff4.org/VolatileSchema#filename";

// AFF4 Image Stream - stores a stream using bevies.
pub const AFF4_IMAGE_TYPE: &str = "http://aff4.org/Schema#ImageStream";
pub const AFF4_LEGACY_IMAGE_TYPE: &str = "http://afflib.org/2009/aff4#stream";
pub const AFF4_SCUDETTE_IMAGE_TYPE: &str = "http://aff4.org/Schema#image";
pub const AFF4_IMAGE_CHUNK_SIZE: &str = "http://aff4.org/Schema#chunkSize";
pub const AFF4_LEGACY_IMAGE_CHUNK_SIZE: &str = "http://afflib.org/2009/aff4#chunkSize";
pub const AFF4_IMAGE_CHUNKS_PER_SEGMENT: &str =
    "http://aff4.org/Schema#chunksInSegment";
pub const AFF4_LEGACY_IMAGE_CHUNKS_PER_SEGMENT: &str =
    "http://afflib.org/2009/aff4#chunksInSegment";
pub const AFF4_IMAGE_COMPRESSION: &str = "http://aff4.org/Schema#compressionMethod";
pub const AFF4_LEGACY_IMAGE_COMPRESSION: &str =
    "http://afflib.org/2009/aff4#CompressionMethod";

pub const AFF4_IMAGE_COMPRESSION_ZLIB: &str = "https://www.ietf.org/rfc/rfc1950.txt";
pub const AFF4_IMAGE_COMPRESSION_SNAPPY: &str = "http://code.google.com/p/snappy/";
pub const AFF4_IMAGE_COMPRESSION_SNAPPY_SCUDETTE: &str =
    "https://github.com/google/snappy";
pub const AFF4_IMAGE_COMPRESSION_STORED: &str =
    "http://aff4.org/Schema#compression/stored";

// AFF4Map - stores a mapping from one stream to another.
pub const AFF4_MAP_TYPE: &str = "http://aff4.org/Schema#Map";
pub const AFF4_LEGACY_MAP_TYPE: &str = "http://afflib.org/2009/aff4#map";
pub const AFF4_SCUDETTE_MAP_TYPE: &str = "http://aff4.org/Schema#map";

// Categories describe the general type of an image.
pub const AFF4_CATEGORY: &str = "http://aff4.org/Schema#category";
pub const AFF4_MEMORY_PHYSICAL: &str = "http://aff4.org/Schema#memory/physical";

/// Relative path of the member filename for URNs a filesystem cannot spell.
pub const AFF4_DIRECTORY_CHILD_FILENAME: &str =
    "http://aff4.org/Schema#directory/filename";

/// The lexicon dialect a container was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lexicon {
    /// AFF4 Standard v1.0
    Standard,
    /// Pre-standard Evimetry 1.x/2.x (afflib.org namespace)
    Legacy,
    /// Scudette/Rekall variant (aff4.org namespace, lowercase type names)
    Scudette,
}

impl Lexicon {
    /// Namespace all dialect names hang off.
    pub fn base(&self) -> &'static str {
        match self {
            Lexicon::Legacy => AFF4_LEGACY_NAMESPACE,
            _ => AFF4_NAMESPACE,
        }
    }

    pub fn image_type(&self) -> String {
        format!("{}Image", self.base())
    }

    pub fn map_type(&self) -> String {
        match self {
            Lexicon::Standard => AFF4_MAP_TYPE.to_string(),
            Lexicon::Legacy => AFF4_LEGACY_MAP_TYPE.to_string(),
            Lexicon::Scudette => AFF4_SCUDETTE_MAP_TYPE.to_string(),
        }
    }

    pub fn stored(&self) -> String {
        format!("{}stored", self.base())
    }

    pub fn target(&self) -> String {
        format!("{}target", self.base())
    }

    pub fn contains(&self) -> String {
        format!("{}contains", self.base())
    }

    pub fn data_stream(&self) -> String {
        format!("{}dataStream", self.base())
    }

    pub fn dependent_stream(&self) -> String {
        format!("{}dependentStream", self.base())
    }

    pub fn block_map_hash(&self) -> String {
        format!("{}blockMapHash", self.base())
    }

    pub fn block_hashes_hash(&self) -> String {
        format!("{}blockHashesHash", self.base())
    }

    pub fn map_point_hash(&self) -> String {
        format!("{}mapPointHash", self.base())
    }

    pub fn map_idx_hash(&self) -> String {
        format!("{}mapIdxHash", self.base())
    }

    pub fn map_path_hash(&self) -> String {
        format!("{}mapPathHash", self.base())
    }

    pub fn map_hash(&self) -> String {
        format!("{}mapHash", self.base())
    }

    pub fn hash(&self) -> String {
        format!("{}hash", self.base())
    }

    pub fn chunk_size(&self) -> String {
        match self {
            Lexicon::Scudette => format!("{}chunk_size", self.base()),
            _ => format!("{}chunkSize", self.base()),
        }
    }

    pub fn chunks_per_segment(&self) -> String {
        match self {
            Lexicon::Scudette => format!("{}chunks_per_segment", self.base()),
            _ => format!("{}chunksInSegment", self.base()),
        }
    }

    pub fn stream_size(&self) -> String {
        format!("{}size", self.base())
    }

    pub fn compression_method(&self) -> String {
        match self {
            Lexicon::Standard => AFF4_IMAGE_COMPRESSION.to_string(),
            Lexicon::Legacy => AFF4_LEGACY_IMAGE_COMPRESSION.to_string(),
            Lexicon::Scudette => format!("{}compression", self.base()),
        }
    }

    pub fn category(&self) -> String {
        format!("{}category", self.base())
    }

    pub fn memory_physical(&self) -> String {
        AFF4_MEMORY_PHYSICAL.to_string()
    }

    /// Predicate used by Rekall memory images for the page table base.
    pub fn memory_page_table_entry_offset(&self) -> String {
        format!("{}memoryPageTableEntryOffset", AFF4_NAMESPACE)
    }

    pub fn osx_kaslr_slide(&self) -> String {
        format!("{}OSXKALSRSlide", AFF4_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_predicates() {
        assert_eq!(
            Lexicon::Standard.chunks_per_segment(),
            "http://aff4.org/Schema#chunksInSegment"
        );
        assert_eq!(
            Lexicon::Scudette.chunks_per_segment(),
            "http://aff4.org/Schema#chunks_per_segment"
        );
        assert_eq!(
            Lexicon::Legacy.compression_method(),
            "http://afflib.org/2009/aff4#CompressionMethod"
        );
        assert_eq!(Lexicon::Legacy.map_type(), "http://afflib.org/2009/aff4#map");
        assert_eq!(Lexicon::Scudette.map_type(), "http://aff4.org/Schema#map");
    }

    #[test]
    fn test_volatile_namespace_is_distinct() {
        assert!(AFF4_STREAM_WRITE_MODE.starts_with(AFF4_VOLATILE_NAMESPACE));
        assert!(AFF4_FILE_NAME.starts_with(AFF4_VOLATILE_NAMESPACE));
        assert!(!AFF4_STORED.starts_with(AFF4_VOLATILE_NAMESPACE));
    }
}
