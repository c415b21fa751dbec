//! The AFF4 object model
//!
//! Every persisted object lives in the resolver cache as a `Handle`
//! (shared, interior-mutable). References between objects are URNs resolved
//! at use time, never pointers; an `ObjectGuard` implements the
//! scoped-acquisition contract by returning its object to the cache on drop.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use aff4_core::{Error, Result, Urn};

use crate::file::{FileStream, MemoryStream};
use crate::image::ImageStream;
use crate::map::MapStream;
use crate::resolver::Resolver;
use crate::symbolic::SymbolicStream;
use crate::zip::{ZipSegment, ZipVolume};

pub type Handle = Rc<RefCell<AnyObject>>;

/// The concrete AFF4 object behind a URN.
pub enum AnyObject {
    File(FileStream),
    Memory(MemoryStream),
    Segment(ZipSegment),
    Volume(ZipVolume),
    Image(ImageStream),
    Map(MapStream),
    Symbolic(SymbolicStream),
}

impl AnyObject {
    pub fn urn(&self) -> &Urn {
        match self {
            AnyObject::File(o) => o.urn(),
            AnyObject::Memory(o) => o.urn(),
            AnyObject::Segment(o) => o.urn(),
            AnyObject::Volume(o) => o.urn(),
            AnyObject::Image(o) => o.urn(),
            AnyObject::Map(o) => o.urn(),
            AnyObject::Symbolic(o) => o.urn(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            AnyObject::File(o) => o.is_dirty(),
            AnyObject::Memory(o) => o.is_dirty(),
            AnyObject::Segment(o) => o.is_dirty(),
            AnyObject::Volume(o) => o.is_dirty(),
            AnyObject::Image(o) => o.is_dirty(),
            AnyObject::Map(o) => o.is_dirty(),
            AnyObject::Symbolic(_) => false,
        }
    }

    pub fn mark_dirty(&mut self) {
        match self {
            AnyObject::File(o) => o.mark_dirty(),
            AnyObject::Memory(o) => o.mark_dirty(),
            AnyObject::Segment(o) => o.mark_dirty(),
            AnyObject::Volume(o) => o.mark_dirty(),
            AnyObject::Image(o) => o.mark_dirty(),
            AnyObject::Map(o) => o.mark_dirty(),
            AnyObject::Symbolic(_) => {}
        }
    }

    /// Reset the stream for a fresh acquisition from the factory.
    pub fn prepare(&mut self) {
        match self {
            AnyObject::File(o) => o.set_readptr(0),
            AnyObject::Memory(o) => o.set_readptr(0),
            AnyObject::Segment(o) => o.set_readptr(0),
            AnyObject::Volume(_) => {}
            AnyObject::Image(o) => o.set_readptr(0),
            AnyObject::Map(o) => o.set_readptr(0),
            AnyObject::Symbolic(o) => o.set_readptr(0),
        }
    }

    pub fn tell(&self) -> u64 {
        match self {
            AnyObject::File(o) => o.readptr(),
            AnyObject::Memory(o) => o.readptr(),
            AnyObject::Segment(o) => o.readptr(),
            AnyObject::Volume(_) => 0,
            AnyObject::Image(o) => o.readptr(),
            AnyObject::Map(o) => o.readptr(),
            AnyObject::Symbolic(o) => o.readptr(),
        }
    }

    pub fn set_readptr(&mut self, offset: u64) {
        match self {
            AnyObject::File(o) => o.set_readptr(offset),
            AnyObject::Memory(o) => o.set_readptr(offset),
            AnyObject::Segment(o) => o.set_readptr(offset),
            AnyObject::Volume(_) => {}
            AnyObject::Image(o) => o.set_readptr(offset),
            AnyObject::Map(o) => o.set_readptr(offset),
            AnyObject::Symbolic(o) => o.set_readptr(offset),
        }
    }

    pub fn size(&self, _resolver: &Resolver) -> Result<u64> {
        match self {
            AnyObject::File(o) => o.size(),
            AnyObject::Memory(o) => Ok(o.size()),
            AnyObject::Segment(o) => Ok(o.size()),
            AnyObject::Volume(o) => Err(Error::programmer(format!(
                "volume {} is not a stream",
                o.urn()
            ))),
            AnyObject::Image(o) => Ok(o.size()),
            AnyObject::Map(o) => Ok(o.size()),
            AnyObject::Symbolic(o) => Ok(o.size()),
        }
    }

    /// Seek with the stream contract: below zero clamps to zero, past the
    /// end is allowed (the next write pads).
    pub fn seek(&mut self, resolver: &Resolver, pos: SeekFrom) -> Result<u64> {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.tell() as i128 + delta as i128,
            SeekFrom::End(delta) => self.size(resolver)? as i128 + delta as i128,
        };
        let clamped = target.max(0) as u64;
        self.set_readptr(clamped);
        Ok(clamped)
    }

    pub fn read(&mut self, resolver: &Resolver, length: usize) -> Result<Vec<u8>> {
        match self {
            AnyObject::File(o) => o.read(length),
            AnyObject::Memory(o) => o.read(length),
            AnyObject::Segment(o) => o.read(resolver, length),
            AnyObject::Volume(o) => Err(Error::programmer(format!(
                "volume {} is not a stream",
                o.urn()
            ))),
            AnyObject::Image(o) => o.read(resolver, length),
            AnyObject::Map(o) => o.read(resolver, length),
            AnyObject::Symbolic(o) => Ok(o.read(length)),
        }
    }

    /// Seek-and-read convenience used by the ZIP layer.
    pub fn read_at(&mut self, resolver: &Resolver, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.set_readptr(offset);
        self.read(resolver, length)
    }

    pub fn write(&mut self, resolver: &Resolver, data: &[u8]) -> Result<usize> {
        match self {
            AnyObject::File(o) => o.write(data),
            AnyObject::Memory(o) => o.write(data),
            AnyObject::Segment(o) => o.write(resolver, data),
            AnyObject::Volume(o) => Err(Error::programmer(format!(
                "volume {} is not a stream",
                o.urn()
            ))),
            AnyObject::Image(o) => o.write(resolver, data),
            AnyObject::Map(o) => o.write(resolver, data),
            AnyObject::Symbolic(o) => o.write().map(|_| 0),
        }
    }

    /// Discard all content of a writable stream.
    pub fn truncate(&mut self) -> Result<()> {
        match self {
            AnyObject::File(o) => o.truncate(),
            AnyObject::Memory(o) => {
                o.truncate();
                Ok(())
            }
            AnyObject::Segment(o) => {
                o.truncate();
                Ok(())
            }
            other => Err(Error::programmer(format!(
                "{} cannot be truncated",
                other.urn()
            ))),
        }
    }

    /// Serialize any pending state. A clean object is a no-op.
    pub fn flush(&mut self, resolver: &Resolver) -> Result<()> {
        match self {
            AnyObject::File(o) => o.flush(),
            AnyObject::Memory(o) => {
                o.clear_dirty();
                Ok(())
            }
            AnyObject::Segment(o) => o.flush(resolver),
            AnyObject::Volume(o) => o.flush(resolver),
            AnyObject::Image(o) => o.flush(resolver),
            AnyObject::Map(o) => o.flush(resolver),
            AnyObject::Symbolic(_) => Ok(()),
        }
    }

    pub fn as_volume(&mut self) -> Result<&mut ZipVolume> {
        match self {
            AnyObject::Volume(volume) => Ok(volume),
            other => Err(Error::programmer(format!(
                "{} is not a volume",
                other.urn()
            ))),
        }
    }

    pub fn as_image(&mut self) -> Result<&mut ImageStream> {
        match self {
            AnyObject::Image(image) => Ok(image),
            other => Err(Error::programmer(format!(
                "{} is not an image stream",
                other.urn()
            ))),
        }
    }

    pub fn as_map(&mut self) -> Result<&mut MapStream> {
        match self {
            AnyObject::Map(map) => Ok(map),
            other => Err(Error::programmer(format!("{} is not a map", other.urn()))),
        }
    }
}

/// Scoped acquisition of a cached object: the object is returned to the
/// cache (in-use → LRU) when the guard drops.
pub struct ObjectGuard<'r> {
    resolver: &'r Resolver,
    handle: Handle,
    key: String,
    defused: Cell<bool>,
}

impl<'r> ObjectGuard<'r> {
    pub(crate) fn new(resolver: &'r Resolver, handle: Handle, key: String) -> Self {
        Self {
            resolver,
            handle,
            key,
            defused: Cell::new(false),
        }
    }

    pub fn borrow(&self) -> Ref<'_, AnyObject> {
        self.handle.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, AnyObject> {
        self.handle.borrow_mut()
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn urn(&self) -> Urn {
        self.handle.borrow().urn().clone()
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Disarm the drop-time return (used by `Resolver::close`).
    pub(crate) fn defuse(&self) {
        self.defused.set(true);
    }
}

impl Drop for ObjectGuard<'_> {
    fn drop(&mut self) {
        if self.defused.get() {
            return;
        }
        if let Err(e) = self.resolver.release(&self.key) {
            tracing::warn!("failed to return {} to cache: {}", self.key, e);
        }
    }
}

/// `std::io::Read + Seek` adapter over a resolver stream, for hashing and
/// external consumers.
pub struct StreamReader<'r> {
    resolver: &'r Resolver,
    guard: ObjectGuard<'r>,
}

impl<'r> StreamReader<'r> {
    pub fn open(resolver: &'r Resolver, urn: &Urn) -> Result<Self> {
        let guard = resolver.open(urn)?;
        Ok(Self { resolver, guard })
    }

    pub fn size(&self) -> Result<u64> {
        self.guard.borrow().size(self.resolver)
    }
}

impl Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self
            .guard
            .borrow_mut()
            .read(self.resolver, buf.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Seek for StreamReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.guard
            .borrow_mut()
            .seek(self.resolver, pos)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}
