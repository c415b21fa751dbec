//! The in-memory triple store
//!
//! A mapping from subject URN to predicate URN to one or more values.
//! `set` replaces, `add` appends. Order within a predicate is insertion
//! order. The volatile namespace and a small set of implied facts are
//! excluded from persistence; those are deducible from the container
//! format itself and would otherwise conflict with it.

use std::collections::{BTreeMap, BTreeSet};

use aff4_core::lexicon;
use aff4_core::{RdfValue, Urn};

/// Predicates suppressed for a given subject type in non-verbose dumps.
fn suppressed_predicates(type_iri: &str) -> &'static [&'static str] {
    match type_iri {
        lexicon::AFF4_ZIP_SEGMENT_TYPE | lexicon::AFF4_ZIP_TYPE => &[
            lexicon::AFF4_STORED,
            lexicon::AFF4_TYPE,
            lexicon::AFF4_STREAM_SIZE,
        ],
        _ => &[],
    }
}

#[derive(Debug, Default)]
pub struct TripleStore {
    store: BTreeMap<String, BTreeMap<String, Vec<RdfValue>>>,
}

impl TripleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the values of `(subject, predicate)` with a single value.
    pub fn set(&mut self, subject: &Urn, predicate: &str, value: RdfValue) {
        self.store
            .entry(subject.to_string())
            .or_default()
            .insert(predicate.to_string(), vec![value]);
    }

    /// Append a value to `(subject, predicate)`.
    pub fn add(&mut self, subject: &Urn, predicate: &str, value: RdfValue) {
        self.store
            .entry(subject.to_string())
            .or_default()
            .entry(predicate.to_string())
            .or_default()
            .push(value);
    }

    /// The first value of `(subject, predicate)`.
    pub fn get(&self, subject: &Urn, predicate: &str) -> Option<&RdfValue> {
        self.store
            .get(subject.as_str())?
            .get(predicate)?
            .first()
    }

    /// All values of `(subject, predicate)` in insertion order.
    pub fn get_all(&self, subject: &Urn, predicate: &str) -> Vec<RdfValue> {
        self.store
            .get(subject.as_str())
            .and_then(|predicates| predicates.get(predicate))
            .cloned()
            .unwrap_or_default()
    }

    pub fn delete_subject(&mut self, subject: &Urn) {
        self.store.remove(subject.as_str());
    }

    /// Move every triple of `old` under `new`, dropping the old subject.
    pub fn rename_subject(&mut self, old: &Urn, new: &Urn) {
        if let Some(predicates) = self.store.remove(old.as_str()) {
            self.store.insert(new.to_string(), predicates);
        }
    }

    /// Subjects holding `value` under `predicate`.
    pub fn query_predicate_object(&self, predicate: &str, value: &RdfValue) -> Vec<Urn> {
        let mut result = Vec::new();
        for (subject, predicates) in &self.store {
            if let Some(values) = predicates.get(predicate) {
                if values.contains(value) {
                    result.push(Urn::new(subject));
                }
            }
        }
        result
    }

    /// All `(subject, value)` pairs under `predicate`.
    pub fn query_predicate(&self, predicate: &str) -> Vec<(Urn, RdfValue)> {
        let mut result = Vec::new();
        for (subject, predicates) in &self.store {
            if let Some(values) = predicates.get(predicate) {
                for value in values {
                    result.push((Urn::new(subject), value.clone()));
                }
            }
        }
        result
    }

    /// All `(predicate, value)` pairs stored for a subject.
    pub fn predicates_by_subject(&self, subject: &Urn) -> Vec<(String, RdfValue)> {
        let mut result = Vec::new();
        if let Some(predicates) = self.store.get(subject.as_str()) {
            for (predicate, values) in predicates {
                for value in values {
                    result.push((predicate.clone(), value.clone()));
                }
            }
        }
        result
    }

    pub fn select_subjects_by_prefix(&self, prefix: &str) -> Vec<Urn> {
        self.store
            .range(prefix.to_string()..)
            .take_while(|(subject, _)| subject.starts_with(prefix))
            .map(|(subject, _)| Urn::new(subject))
            .collect()
    }

    /// Visit every persistable triple. Suppression rules:
    /// subjects without a type are skipped, volatile predicates are skipped,
    /// and implied facts for ZIP objects are skipped, unless `verbose`.
    pub fn for_each_persistent<F>(&self, verbose: bool, mut visit: F)
    where
        F: FnMut(&str, &str, &RdfValue),
    {
        for (subject, predicates) in &self.store {
            let types = match predicates.get(lexicon::AFF4_TYPE) {
                Some(types) => types,
                None => continue,
            };

            let mut suppressed: BTreeSet<&str> = BTreeSet::new();
            if !verbose {
                for value in types {
                    if let RdfValue::Urn(type_urn) = value {
                        for predicate in suppressed_predicates(type_urn.as_str()) {
                            suppressed.insert(predicate);
                        }
                    }
                }
            }

            for (predicate, values) in predicates {
                if !verbose {
                    if predicate.starts_with(lexicon::AFF4_VOLATILE_NAMESPACE) {
                        continue;
                    }
                    if suppressed.contains(predicate.as_str()) {
                        continue;
                    }
                }
                for value in values {
                    visit(subject, predicate, value);
                }
            }
        }
    }

    pub fn subjects(&self) -> Vec<Urn> {
        self.store.keys().map(Urn::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(s: &str) -> Urn {
        Urn::new(s)
    }

    #[test]
    fn test_set_replaces() {
        let mut store = TripleStore::new();
        let subject = urn("aff4://hello");

        store.set(&subject, "p", RdfValue::from("foo"));
        store.set(&subject, "p", RdfValue::from("bar"));

        assert_eq!(store.get(&subject, "p"), Some(&RdfValue::from("bar")));
        assert_eq!(store.get_all(&subject, "p").len(), 1);
    }

    #[test]
    fn test_add_promotes_to_list() {
        let mut store = TripleStore::new();
        let subject = urn("aff4://hello");

        store.add(&subject, "p", RdfValue::from("a"));
        store.add(&subject, "p", RdfValue::from("b"));

        let all = store.get_all(&subject, "p");
        assert_eq!(all, vec![RdfValue::from("a"), RdfValue::from("b")]);
        // Get returns the first value.
        assert_eq!(store.get(&subject, "p"), Some(&RdfValue::from("a")));
    }

    #[test]
    fn test_query_predicate_object() {
        let mut store = TripleStore::new();
        store.set(&urn("aff4://a"), "p", RdfValue::from("x"));
        store.set(&urn("aff4://b"), "p", RdfValue::from("x"));
        store.set(&urn("aff4://c"), "p", RdfValue::from("y"));

        let subjects = store.query_predicate_object("p", &RdfValue::from("x"));
        assert_eq!(subjects, vec![urn("aff4://a"), urn("aff4://b")]);
    }

    #[test]
    fn test_select_subjects_by_prefix() {
        let mut store = TripleStore::new();
        store.set(&urn("aff4://img/blockhash.md5"), "p", RdfValue::from("x"));
        store.set(&urn("aff4://img/blockhash.sha1"), "p", RdfValue::from("x"));
        store.set(&urn("aff4://other"), "p", RdfValue::from("x"));

        let subjects = store.select_subjects_by_prefix("aff4://img/blockhash.");
        assert_eq!(subjects.len(), 2);
    }

    #[test]
    fn test_volatile_suppressed() {
        let mut store = TripleStore::new();
        let subject = urn("aff4://a");
        store.set(
            &subject,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(urn(lexicon::AFF4_IMAGE_TYPE)),
        );
        store.set(
            &subject,
            lexicon::AFF4_STREAM_WRITE_MODE,
            RdfValue::from("truncate"),
        );

        let mut seen = Vec::new();
        store.for_each_persistent(false, |_, p, _| seen.push(p.to_string()));
        assert_eq!(seen, vec![lexicon::AFF4_TYPE.to_string()]);

        let mut verbose = Vec::new();
        store.for_each_persistent(true, |_, p, _| verbose.push(p.to_string()));
        assert_eq!(verbose.len(), 2);
    }

    #[test]
    fn test_zip_segment_facts_suppressed() {
        let mut store = TripleStore::new();
        let segment = urn("aff4://vol/segment");
        store.set(
            &segment,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(urn(lexicon::AFF4_ZIP_SEGMENT_TYPE)),
        );
        store.set(
            &segment,
            lexicon::AFF4_STORED,
            RdfValue::Urn(urn("aff4://vol")),
        );

        let mut count = 0;
        store.for_each_persistent(false, |_, _, _| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_untyped_subject_not_persisted() {
        let mut store = TripleStore::new();
        store.set(&urn("file:///tmp/x"), "p", RdfValue::from("v"));

        let mut count = 0;
        store.for_each_persistent(false, |_, _, _| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_rename_subject() {
        let mut store = TripleStore::new();
        let old = urn("aff4://old");
        let new = urn("aff4://new");
        store.set(&old, "p", RdfValue::from("v"));

        store.rename_subject(&old, &new);
        assert!(store.get(&old, "p").is_none());
        assert_eq!(store.get(&new, "p"), Some(&RdfValue::from("v")));
    }
}
