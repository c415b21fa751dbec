//! # AFF4 Containers
//!
//! The container layer of the AFF4 library:
//!
//! - **Resolver**: triple store, Turtle I/O, two-tier object cache, factory
//! - **ZIP64 volume**: writable, appendable archive with a concatenation-safe
//!   central directory
//! - **Streams**: file-backed, in-memory, bevy image, map, and symbolic
//! - **Container**: lexicon identification and top-level opening
//!
//! ## Example
//!
//! ```rust,no_run
//! use aff4_containers::{Container, StreamReader};
//! use std::io::Read;
//!
//! let opened = Container::open("/evidence/disk.aff4").unwrap();
//! let mut stream = StreamReader::open(&opened.resolver, &opened.stream_urn).unwrap();
//! let mut sector = vec![0u8; 512];
//! stream.read_exact(&mut sector).unwrap();
//! ```

pub mod cache;
pub mod container;
pub mod file;
pub mod image;
pub mod map;
pub mod object;
pub mod resolver;
pub mod store;
pub mod symbolic;
pub mod turtle;
pub mod zip;

// Re-export commonly used items
pub use container::{Container, OpenedContainer};
pub use image::{BevyIndex, ImageStream};
pub use map::{MapRange, MapStream};
pub use object::{AnyObject, Handle, ObjectGuard, StreamReader};
pub use resolver::Resolver;
pub use zip::{ZipSegment, ZipVolume};
