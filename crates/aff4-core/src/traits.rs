//! Combined I/O traits used at the library's seams

use std::io::{Read, Seek, Write};

/// Combined trait for Read + Seek
pub trait ReadSeek: Read + Seek {}

/// Blanket implementation for any type that implements Read + Seek
impl<T: Read + Seek> ReadSeek for T {}

/// Combined trait for Read + Write + Seek
pub trait ReadWriteSeek: Read + Write + Seek {}

/// Blanket implementation for any type that implements Read + Write + Seek
impl<T: Read + Write + Seek> ReadWriteSeek for T {}
