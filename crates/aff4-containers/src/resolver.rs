//! The resolver: triple store, Turtle I/O, object cache and factory
//!
//! The resolver is the sole shared mutable state of the library. Objects
//! are created through `open`, which dispatches on (1) symbolic stream
//! patterns, (2) the stored RDF type, (3) the URN scheme, and caches the
//! result. Every opened object must be released (the guard does this on
//! drop) before the resolver may be flushed.

use std::cell::RefCell;
use std::io::Write;

use aff4_core::lexicon;
use aff4_core::{Error, Lexicon, RdfValue, Result, Urn};

use crate::cache::ObjectCache;
use crate::file::FileStream;
use crate::image::ImageStream;
use crate::map::MapStream;
use crate::object::{AnyObject, Handle, ObjectGuard};
use crate::store::TripleStore;
use crate::symbolic;
use crate::turtle;
use crate::zip::{ZipSegment, ZipVolume};

const DEFAULT_CACHE_CAPACITY: usize = 10;

#[derive(Clone, Copy)]
enum HandlerKind {
    File,
    Volume,
    Segment,
    Image,
    Map,
}

/// The process-global type registry, wired at init. First registered type
/// wins when a subject carries several.
fn registered_handler(type_iri: &str) -> Option<HandlerKind> {
    match type_iri {
        lexicon::AFF4_ZIP_TYPE => Some(HandlerKind::Volume),
        lexicon::AFF4_ZIP_SEGMENT_TYPE => Some(HandlerKind::Segment),
        lexicon::AFF4_IMAGE_TYPE
        | lexicon::AFF4_LEGACY_IMAGE_TYPE
        | lexicon::AFF4_SCUDETTE_IMAGE_TYPE => Some(HandlerKind::Image),
        lexicon::AFF4_MAP_TYPE
        | lexicon::AFF4_LEGACY_MAP_TYPE
        | lexicon::AFF4_SCUDETTE_MAP_TYPE => Some(HandlerKind::Map),
        lexicon::AFF4_FILE_TYPE => Some(HandlerKind::File),
        _ => None,
    }
}

fn scheme_handler(scheme: &str) -> Option<HandlerKind> {
    match scheme {
        "file" => Some(HandlerKind::File),
        _ => None,
    }
}

pub struct Resolver {
    flavor: Lexicon,
    store: RefCell<TripleStore>,
    cache: RefCell<ObjectCache>,
    aff4_ns: RefCell<Option<String>>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(Lexicon::Standard)
    }
}

impl Resolver {
    pub fn new(flavor: Lexicon) -> Self {
        Self::with_cache_capacity(flavor, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(flavor: Lexicon, capacity: usize) -> Self {
        Self {
            flavor,
            store: RefCell::new(TripleStore::new()),
            cache: RefCell::new(ObjectCache::new(capacity)),
            aff4_ns: RefCell::new(None),
        }
    }

    pub fn lexicon(&self) -> Lexicon {
        self.flavor
    }

    // ------------------------------------------------------------------
    // Triple operations
    // ------------------------------------------------------------------

    pub fn set(&self, subject: &Urn, predicate: &str, value: RdfValue) {
        self.store.borrow_mut().set(subject, predicate, value);
    }

    pub fn add(&self, subject: &Urn, predicate: &str, value: RdfValue) {
        self.store.borrow_mut().add(subject, predicate, value);
    }

    pub fn get(&self, subject: &Urn, predicate: &str) -> Option<RdfValue> {
        self.store.borrow().get(subject, predicate).cloned()
    }

    pub fn get_all(&self, subject: &Urn, predicate: &str) -> Vec<RdfValue> {
        self.store.borrow().get_all(subject, predicate)
    }

    pub fn get_urn(&self, subject: &Urn, predicate: &str) -> Option<Urn> {
        self.get(subject, predicate).and_then(|value| value.as_urn())
    }

    pub fn get_integer(&self, subject: &Urn, predicate: &str) -> Option<i64> {
        self.get(subject, predicate).and_then(|value| value.as_integer())
    }

    pub fn get_text(&self, subject: &Urn, predicate: &str) -> Option<String> {
        self.get(subject, predicate)
            .and_then(|value| value.as_text().map(|s| s.to_string()))
    }

    pub fn delete_subject(&self, subject: &Urn) {
        self.store.borrow_mut().delete_subject(subject);
    }

    /// Retain a subject's triples under a new URN (volume rename on load).
    pub fn rename_subject(&self, old: &Urn, new: &Urn) {
        self.store.borrow_mut().rename_subject(old, new);
    }

    pub fn query_predicate_object(&self, predicate: &str, value: &RdfValue) -> Vec<Urn> {
        self.store.borrow().query_predicate_object(predicate, value)
    }

    pub fn query_subject_predicate(&self, subject: &Urn, predicate: &str) -> Vec<RdfValue> {
        self.store.borrow().get_all(subject, predicate)
    }

    pub fn query_predicate(&self, predicate: &str) -> Vec<(Urn, RdfValue)> {
        self.store.borrow().query_predicate(predicate)
    }

    pub fn select_subjects_by_prefix(&self, prefix: &str) -> Vec<Urn> {
        self.store.borrow().select_subjects_by_prefix(prefix)
    }

    pub fn query_predicates_by_subject(&self, subject: &Urn) -> Vec<(String, RdfValue)> {
        self.store.borrow().predicates_by_subject(subject)
    }

    // ------------------------------------------------------------------
    // Turtle I/O
    // ------------------------------------------------------------------

    pub fn dump_to_turtle(&self, writer: &mut dyn Write, verbose: bool) -> Result<()> {
        turtle::dump(&self.store.borrow(), self.flavor, writer, verbose)
    }

    pub fn dump_turtle_bytes(&self, verbose: bool) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.dump_to_turtle(&mut buffer, verbose)?;
        Ok(buffer)
    }

    pub fn load_from_turtle(&self, data: &[u8]) -> Result<()> {
        let namespace = turtle::load(&mut self.store.borrow_mut(), data)?;
        if namespace.is_some() {
            *self.aff4_ns.borrow_mut() = namespace;
        }
        Ok(())
    }

    /// The AFF4 namespace declared by the last loaded Turtle document.
    pub fn aff4_namespace(&self) -> Option<String> {
        self.aff4_ns.borrow().clone()
    }

    // ------------------------------------------------------------------
    // Factory and cache
    // ------------------------------------------------------------------

    /// Open a URN, constructing the handler its stored type (or scheme)
    /// calls for. The returned guard must be dropped (or closed) before the
    /// resolver can be flushed.
    pub fn open(&self, urn: &Urn) -> Result<ObjectGuard<'_>> {
        if let Some(handle) = self.cache.borrow_mut().get(urn.as_str()) {
            handle.borrow_mut().prepare();
            return Ok(ObjectGuard::new(self, handle, urn.to_string()));
        }

        let object = if symbolic::is_symbolic(urn.as_str(), self.flavor) {
            AnyObject::Symbolic(symbolic::create(urn, self.flavor)?)
        } else {
            let mut handler = None;
            for value in self.get_all(urn, lexicon::AFF4_TYPE) {
                if let RdfValue::Urn(type_urn) = value {
                    if let Some(kind) = registered_handler(type_urn.as_str()) {
                        handler = Some(kind);
                        break;
                    }
                }
            }
            let kind = match handler.or_else(|| scheme_handler(&urn.scheme())) {
                Some(kind) => kind,
                None => {
                    return Err(Error::not_found(format!("unable to create object {}", urn)))
                }
            };

            match kind {
                HandlerKind::File => AnyObject::File(FileStream::open(self, urn)?),
                HandlerKind::Volume => AnyObject::Volume(ZipVolume::load(self, urn)?),
                HandlerKind::Segment => AnyObject::Segment(ZipSegment::load(self, urn)?),
                HandlerKind::Image => AnyObject::Image(ImageStream::load(self, urn)?),
                HandlerKind::Map => AnyObject::Map(MapStream::load(self, urn)?),
            }
        };

        // The object may have renamed itself while loading (URN comment).
        let key = object.urn().to_string();
        let handle: Handle = std::rc::Rc::new(RefCell::new(object));
        self.cache
            .borrow_mut()
            .put(key.clone(), handle.clone(), true)?;
        handle.borrow_mut().prepare();
        Ok(ObjectGuard::new(self, handle, key))
    }

    /// Fetch from the cache without constructing. Unlike `open` the stream
    /// position is left untouched.
    pub fn cache_get(&self, urn: &Urn) -> Option<ObjectGuard<'_>> {
        let handle = self.cache.borrow_mut().get(urn.as_str())?;
        Some(ObjectGuard::new(self, handle, urn.to_string()))
    }

    /// Place a freshly constructed object into the cache as in-use.
    pub fn cache_put(&self, object: AnyObject) -> Result<ObjectGuard<'_>> {
        let key = object.urn().to_string();
        let handle: Handle = std::rc::Rc::new(RefCell::new(object));
        self.cache
            .borrow_mut()
            .put(key.clone(), handle.clone(), true)?;
        Ok(ObjectGuard::new(self, handle, key))
    }

    pub(crate) fn release(&self, key: &str) -> Result<()> {
        self.cache.borrow_mut().return_object(key)
    }

    /// Flush an object and drop it from the cache entirely.
    pub fn close(&self, guard: ObjectGuard<'_>) -> Result<()> {
        guard.defuse();
        let handle = self.cache.borrow_mut().remove(guard.key())?;
        let result = handle.borrow_mut().flush(self);
        result
    }

    /// Flush every dirty cached object until a full pass finds none dirty,
    /// then empty the cache. Flushing while objects are in use is a
    /// programmer error.
    pub fn flush(&self) -> Result<()> {
        {
            let cache = self.cache.borrow();
            if !cache.in_use_is_empty() {
                return Err(Error::programmer(format!(
                    "resolver flushed while objects in use: {:?}",
                    cache.in_use_keys()
                )));
            }
        }

        loop {
            let dirty: Vec<Handle> = self
                .cache
                .borrow()
                .lru_handles()
                .into_iter()
                .filter(|handle| handle.borrow().is_dirty())
                .collect();
            if dirty.is_empty() {
                break;
            }
            for handle in dirty {
                handle.borrow_mut().flush(self)?;
            }
        }

        self.cache.borrow_mut().clear_lru();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let resolver = Resolver::default();
        let subject = Urn::new("aff4://hello");

        resolver.set(
            &subject,
            lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY,
            RdfValue::from("foo"),
        );
        assert_eq!(
            resolver.get(&subject, lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY),
            Some(RdfValue::from("foo"))
        );

        // A second set overwrites the previous value.
        resolver.set(
            &subject,
            lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY,
            RdfValue::from("bar"),
        );
        assert_eq!(
            resolver.get(&subject, lexicon::AFF4_IMAGE_COMPRESSION_SNAPPY),
            Some(RdfValue::from("bar"))
        );
    }

    #[test]
    fn test_turtle_serialization_roundtrip() {
        let resolver = Resolver::default();
        let subject = Urn::new("aff4://hello");
        resolver.set(
            &subject,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(Urn::new(lexicon::AFF4_IMAGE_TYPE)),
        );
        resolver.set(&subject, lexicon::AFF4_STREAM_SIZE, RdfValue::Integer(42));

        let turtle = resolver.dump_turtle_bytes(true).unwrap();

        let fresh = Resolver::default();
        fresh.load_from_turtle(&turtle).unwrap();
        assert_eq!(
            fresh.get(&subject, lexicon::AFF4_STREAM_SIZE),
            Some(RdfValue::Integer(42))
        );
        assert_eq!(
            fresh.aff4_namespace().as_deref(),
            Some(lexicon::AFF4_NAMESPACE)
        );
    }

    #[test]
    fn test_open_unknown_urn_fails() {
        let resolver = Resolver::default();
        assert!(matches!(
            resolver.open(&Urn::new("aff4://nowhere")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_open_symbolic_stream() {
        let resolver = Resolver::default();
        let zero = Urn::new("http://aff4.org/Schema#Zero");

        let guard = resolver.open(&zero).unwrap();
        let data = guard.borrow_mut().read(&resolver, 4).unwrap();
        assert_eq!(data, vec![0, 0, 0, 0]);
        drop(guard);

        resolver.flush().unwrap();
    }

    #[test]
    fn test_flush_while_in_use_is_programmer_error() {
        let resolver = Resolver::default();
        let zero = Urn::new("http://aff4.org/Schema#Zero");
        let _guard = resolver.open(&zero).unwrap();
        assert!(matches!(resolver.flush(), Err(Error::Programmer(_))));
    }

    #[test]
    fn test_guard_returns_object_on_drop() {
        let resolver = Resolver::default();
        let zero = Urn::new("http://aff4.org/Schema#Zero");
        {
            let _guard = resolver.open(&zero).unwrap();
        }
        // Returned to the LRU: a fresh open hits the cache.
        assert!(resolver.cache_get(&zero).is_some());
    }
}
