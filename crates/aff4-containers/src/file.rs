//! File-backed and in-memory streams
//!
//! The bottom of every stack: a seekable byte stream over a filesystem file
//! or an owned buffer. The write mode is resolved from the volatile
//! `writable` predicate; `truncate` recreates the file, builds intermediate
//! directories and downgrades itself to `append` so later reopens in the
//! same session do not wipe the data again.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use aff4_core::lexicon;
use aff4_core::{Error, RdfValue, Result, Urn};

use crate::resolver::Resolver;

pub struct FileStream {
    urn: Urn,
    fd: File,
    readptr: u64,
    dirty: bool,
    writable: bool,
}

impl FileStream {
    pub fn open(resolver: &Resolver, urn: &Urn) -> Result<Self> {
        let filename = match resolver.get_text(urn, lexicon::AFF4_FILE_NAME) {
            Some(name) => name,
            None => urn.to_filename().ok_or_else(|| {
                Error::not_found(format!("unable to find storage for {}", urn))
            })?,
        };

        let mode = resolver
            .get_text(urn, lexicon::AFF4_STREAM_WRITE_MODE)
            .unwrap_or_else(|| "read".to_string());

        tracing::info!("Opening file {} ({})", filename, mode);

        let (fd, writable) = match mode.as_str() {
            "truncate" => {
                create_intermediate_directories(&filename)?;
                let fd = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&filename)?;
                // Later reopens must not wipe the file again.
                resolver.set(
                    urn,
                    lexicon::AFF4_STREAM_WRITE_MODE,
                    RdfValue::from("append"),
                );
                (fd, true)
            }
            "append" => {
                create_intermediate_directories(&filename)?;
                let fd = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&filename)?;
                (fd, true)
            }
            _ => (OpenOptions::new().read(true).open(&filename)?, false),
        };

        Ok(Self {
            urn: urn.clone(),
            fd,
            readptr: 0,
            dirty: false,
            writable,
        })
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

    pub fn read(&mut self, length: usize) -> Result<Vec<u8>> {
        self.fd.seek(SeekFrom::Start(self.readptr))?;

        let mut data = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let count = self.fd.read(&mut data[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        data.truncate(filled);
        self.readptr += filled as u64;
        Ok(data)
    }

    pub fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.set_readptr(offset);
        self.read(length)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::programmer(format!(
                "writing to read-only stream {}",
                self.urn
            )));
        }
        self.dirty = true;
        self.fd.seek(SeekFrom::Start(self.readptr))?;
        self.fd.write_all(data)?;
        self.readptr += data.len() as u64;
        Ok(data.len())
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.fd.metadata()?.len())
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.fd.set_len(0)?;
        self.readptr = 0;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.fd.flush()?;
        }
        self.dirty = false;
        Ok(())
    }
}

/// Recursively create intermediate directories for a target file.
fn create_intermediate_directories(filename: &str) -> Result<()> {
    if let Some(parent) = Path::new(filename).parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            tracing::info!("Creating intermediate directories {}", parent.display());
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// A seekable stream over an owned buffer, usable wherever a file-backed
/// stream is (including as a volume backing store in tests).
pub struct MemoryStream {
    urn: Urn,
    data: Vec<u8>,
    readptr: u64,
    dirty: bool,
}

impl MemoryStream {
    pub fn new(urn: Urn) -> Self {
        Self {
            urn,
            data: Vec::new(),
            readptr: 0,
            dirty: false,
        }
    }

    pub fn with_data(urn: Urn, data: Vec<u8>) -> Self {
        Self {
            urn,
            data,
            readptr: 0,
            dirty: false,
        }
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

    pub fn read(&mut self, length: usize) -> Result<Vec<u8>> {
        let start = (self.readptr as usize).min(self.data.len());
        let end = start.saturating_add(length).min(self.data.len());
        let result = self.data[start..end].to_vec();
        self.readptr += result.len() as u64;
        Ok(result)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.dirty = true;
        let offset = self.readptr as usize;
        if offset > self.data.len() {
            // Seeking past end pads with zeros on the next write.
            self.data.resize(offset, 0);
        }
        let overlap = (self.data.len() - offset).min(data.len());
        self.data[offset..offset + overlap].copy_from_slice(&data[..overlap]);
        self.data.extend_from_slice(&data[overlap..]);
        self.readptr += data.len() as u64;
        Ok(data.len())
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn truncate(&mut self) {
        self.data.clear();
        self.readptr = 0;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_stream_contract() {
        let mut stream = MemoryStream::new(Urn::new("aff4://mem"));
        assert_eq!(stream.readptr(), 0);
        assert_eq!(stream.size(), 0);

        stream.write(b"hello world").unwrap();
        assert_eq!(stream.readptr(), 11);

        stream.set_readptr(0);
        assert_eq!(stream.read(1000).unwrap(), b"hello world");

        // Overwrite from five before the end.
        stream.set_readptr(stream.size() - 5);
        stream.write(b"Cruel world").unwrap();
        stream.set_readptr(0);
        assert_eq!(stream.read(1000).unwrap(), b"hello Cruel world");
        assert_eq!(stream.readptr(), 17);
    }

    #[test]
    fn test_memory_write_past_end_pads() {
        let mut stream = MemoryStream::new(Urn::new("aff4://mem"));
        stream.set_readptr(4);
        stream.write(b"xy").unwrap();
        assert_eq!(stream.bytes(), b"\x00\x00\x00\x00xy");
    }

    use std::io::SeekFrom;

    #[test]
    fn test_file_stream_contract_through_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let urn = Urn::from_filename(dir.path().join("stream.bin").to_str().unwrap());

        let resolver = Resolver::default();
        resolver.set(&urn, lexicon::AFF4_STREAM_WRITE_MODE, RdfValue::from("truncate"));

        let stream = resolver.open(&urn).unwrap();
        let mut object = stream.borrow_mut();

        assert_eq!(object.tell(), 0);
        assert_eq!(object.size(&resolver).unwrap(), 0);

        object.write(&resolver, b"hello world").unwrap();
        assert_eq!(object.tell(), 11);

        object.seek(&resolver, SeekFrom::Start(0)).unwrap();
        assert_eq!(object.read(&resolver, 1000).unwrap(), b"hello world");

        object.seek(&resolver, SeekFrom::End(-5)).unwrap();
        assert_eq!(object.tell(), 6);
        object.write(&resolver, b"Cruel world").unwrap();

        object.seek(&resolver, SeekFrom::Start(0)).unwrap();
        assert_eq!(object.read(&resolver, 1000).unwrap(), b"hello Cruel world");
        assert_eq!(object.tell(), 17);

        // Seeking below zero clamps to zero.
        object.seek(&resolver, SeekFrom::Start(2)).unwrap();
        assert_eq!(object.seek(&resolver, SeekFrom::Current(-10)).unwrap(), 0);
    }

    #[test]
    fn test_truncate_mode_downgrades_to_append() {
        let dir = tempfile::tempdir().unwrap();
        let urn = Urn::from_filename(dir.path().join("mode.bin").to_str().unwrap());

        let resolver = Resolver::default();
        resolver.set(&urn, lexicon::AFF4_STREAM_WRITE_MODE, RdfValue::from("truncate"));

        {
            let stream = resolver.open(&urn).unwrap();
            stream.borrow_mut().write(&resolver, b"payload").unwrap();
        }
        assert_eq!(
            resolver.get_text(&urn, lexicon::AFF4_STREAM_WRITE_MODE).as_deref(),
            Some("append")
        );

        // A second open in the same session must not wipe the file.
        let mut fresh = FileStream::open(&resolver, &urn).unwrap();
        assert_eq!(fresh.size().unwrap(), 7);
        assert_eq!(fresh.read(7).unwrap(), b"payload");
    }

    #[test]
    fn test_truncate_creates_intermediate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c/evidence.bin");
        let urn = Urn::from_filename(nested.to_str().unwrap());

        let resolver = Resolver::default();
        resolver.set(&urn, lexicon::AFF4_STREAM_WRITE_MODE, RdfValue::from("truncate"));

        let mut stream = FileStream::open(&resolver, &urn).unwrap();
        stream.write(b"x").unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn test_read_only_write_is_programmer_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.bin");
        std::fs::write(&path, b"data").unwrap();
        let urn = Urn::from_filename(path.to_str().unwrap());

        let resolver = Resolver::default();
        let mut stream = FileStream::open(&resolver, &urn).unwrap();
        assert!(stream.write(b"nope").is_err());
    }
}
