//! Turtle serialization of the triple store
//!
//! Dumping is hand-rolled (prefixed, one subject block per paragraph) so the
//! output matches what the other AFF4 implementations emit closely enough for
//! their namespace sniffing to work on ours. Parsing goes through
//! `rio_turtle` and maps typed literals back through the datatype registry.

use std::io::Write;

use rio_api::model::{Literal, Subject, Term, Triple};
use rio_api::parser::TriplesParser;
use rio_turtle::{TurtleError, TurtleParser};

use aff4_core::lexicon;
use aff4_core::{Error, Lexicon, RdfValue, Result, Urn};

use crate::store::TripleStore;

fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn is_local_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Abbreviate an IRI against the prefix table, falling back to `<iri>`.
fn abbreviate(iri: &str, aff4_base: &str) -> String {
    for (prefix, namespace) in [
        ("aff4", aff4_base),
        ("rdf", lexicon::RDF_NAMESPACE),
        ("xsd", lexicon::XSD_NAMESPACE),
    ] {
        if let Some(local) = iri.strip_prefix(namespace) {
            if is_local_name(local) {
                return format!("{}:{}", prefix, local);
            }
        }
    }
    format!("<{}>", iri)
}

fn format_object(value: &RdfValue, aff4_base: &str) -> String {
    match value {
        RdfValue::Urn(urn) => abbreviate(urn.as_str(), aff4_base),
        RdfValue::String(s) => format!("\"{}\"", escape_literal(s)),
        other => {
            let datatype = other
                .datatype_iri()
                .unwrap_or_else(|| format!("{}string", lexicon::XSD_NAMESPACE));
            format!(
                "\"{}\"^^{}",
                escape_literal(&other.serialize()),
                abbreviate(&datatype, aff4_base)
            )
        }
    }
}

/// Serialize every persistable triple to Turtle.
pub fn dump(
    store: &TripleStore,
    lexicon_flavor: Lexicon,
    writer: &mut dyn Write,
    verbose: bool,
) -> Result<()> {
    let aff4_base = lexicon_flavor.base();

    writeln!(writer, "@prefix aff4: <{}> .", aff4_base)?;
    writeln!(writer, "@prefix rdf: <{}> .", lexicon::RDF_NAMESPACE)?;
    writeln!(writer, "@prefix xsd: <{}> .", lexicon::XSD_NAMESPACE)?;
    writeln!(writer)?;

    let mut current_subject: Option<String> = None;
    let mut lines: Vec<String> = Vec::new();
    let mut error: Option<std::io::Error> = None;

    let mut emit = |writer: &mut dyn Write,
                    subject: &str,
                    lines: &mut Vec<String>| {
        if lines.is_empty() {
            return Ok(());
        }
        writeln!(writer, "<{}>", subject)?;
        writeln!(writer, "    {} .", lines.join(" ;\n    "))?;
        writeln!(writer)?;
        lines.clear();
        Ok(())
    };

    store.for_each_persistent(verbose, |subject, predicate, value| {
        if error.is_some() {
            return;
        }
        if current_subject.as_deref() != Some(subject) {
            if let Some(previous) = current_subject.take() {
                if let Err(e) = emit(&mut *writer, &previous, &mut lines) {
                    error = Some(e);
                    return;
                }
            }
            current_subject = Some(subject.to_string());
        }
        lines.push(format!(
            "{} {}",
            abbreviate(predicate, aff4_base),
            format_object(value, aff4_base)
        ));
    });

    if let Some(e) = error {
        return Err(e.into());
    }
    if let Some(previous) = current_subject {
        emit(&mut *writer, &previous, &mut lines)?;
    }
    Ok(())
}

/// Sniff the AFF4 namespace declared in a Turtle document.
pub fn sniff_namespace(data: &str) -> Option<String> {
    for line in data.lines() {
        let line = line.trim();
        if !line.starts_with("@prefix") {
            continue;
        }
        for namespace in [lexicon::AFF4_NAMESPACE, lexicon::AFF4_LEGACY_NAMESPACE] {
            if line.contains(&format!("<{}>", namespace)) {
                return Some(namespace.to_string());
            }
        }
    }
    None
}

/// Parse a Turtle document into the store (values append with `add`).
/// Returns the sniffed AFF4 namespace, if any was declared.
pub fn load(store: &mut TripleStore, data: &[u8]) -> Result<Option<String>> {
    let text = String::from_utf8_lossy(data).into_owned();
    let namespace = sniff_namespace(&text);

    let mut parser = TurtleParser::new(text.as_bytes(), None);
    parser
        .parse_all(&mut |triple: Triple| -> std::result::Result<(), TurtleError> {
            let subject = match triple.subject {
                Subject::NamedNode(node) => Urn::new(node.iri),
                // AFF4 stores never use blank nodes.
                _ => return Ok(()),
            };
            let predicate = triple.predicate.iri;

            let value = match triple.object {
                Term::NamedNode(node) => RdfValue::Urn(Urn::new(node.iri)),
                Term::Literal(Literal::Simple { value }) => RdfValue::from(value),
                Term::Literal(Literal::LanguageTaggedString { value, .. }) => {
                    RdfValue::from(value)
                }
                Term::Literal(Literal::Typed { value, datatype }) => {
                    // Malformed typed literals in foreign containers degrade
                    // to plain strings rather than aborting the load.
                    RdfValue::parse_typed(datatype.iri, value)
                        .unwrap_or_else(|_| RdfValue::from(value))
                }
                _ => return Ok(()),
            };

            store.add(&subject, predicate, value);
            Ok(())
        })
        .map_err(|e| Error::format(format!("turtle parse error: {}", e)))?;

    Ok(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> TripleStore {
        let mut store = TripleStore::new();
        let image = Urn::new("aff4://image");
        store.set(
            &image,
            lexicon::AFF4_TYPE,
            RdfValue::Urn(Urn::new(lexicon::AFF4_IMAGE_TYPE)),
        );
        store.set(&image, lexicon::AFF4_IMAGE_CHUNK_SIZE, RdfValue::Integer(32768));
        store.set(
            &image,
            lexicon::AFF4_STREAM_ORIGINAL_FILENAME,
            RdfValue::from("disk \"0\".dd"),
        );
        store.add(
            &image,
            "http://aff4.org/Schema#hash",
            RdfValue::Hash(
                aff4_core::HashKind::Sha1,
                "7d3d27f667f95f7ec5b9d32121622c0f4b60b48d".to_string(),
            ),
        );
        store
    }

    #[test]
    fn test_dump_load_roundtrip() {
        let store = sample_store();
        let mut buffer = Vec::new();
        dump(&store, Lexicon::Standard, &mut buffer, false).unwrap();

        let mut reloaded = TripleStore::new();
        let namespace = load(&mut reloaded, &buffer).unwrap();
        assert_eq!(namespace.as_deref(), Some(lexicon::AFF4_NAMESPACE));

        let image = Urn::new("aff4://image");
        assert_eq!(
            reloaded.get(&image, lexicon::AFF4_IMAGE_CHUNK_SIZE),
            Some(&RdfValue::Integer(32768))
        );
        assert_eq!(
            reloaded.get(&image, lexicon::AFF4_STREAM_ORIGINAL_FILENAME),
            Some(&RdfValue::from("disk \"0\".dd"))
        );
        assert_eq!(
            reloaded.get(&image, lexicon::AFF4_TYPE),
            Some(&RdfValue::Urn(Urn::new(lexicon::AFF4_IMAGE_TYPE)))
        );
        assert_eq!(
            reloaded.get(&image, "http://aff4.org/Schema#hash"),
            Some(&RdfValue::Hash(
                aff4_core::HashKind::Sha1,
                "7d3d27f667f95f7ec5b9d32121622c0f4b60b48d".to_string()
            ))
        );
    }

    #[test]
    fn test_legacy_namespace_sniff() {
        let turtle = format!(
            "@prefix aff4: <{}> .\n<aff4://x> aff4:size \"1\"^^<{}integer> .\n",
            lexicon::AFF4_LEGACY_NAMESPACE,
            lexicon::XSD_NAMESPACE
        );
        let mut store = TripleStore::new();
        let namespace = load(&mut store, turtle.as_bytes()).unwrap();
        assert_eq!(namespace.as_deref(), Some(lexicon::AFF4_LEGACY_NAMESPACE));
    }

    #[test]
    fn test_load_foreign_prefixes() {
        let turtle = r#"
@prefix aff4: <http://aff4.org/Schema#> .
@prefix rdf: <http://www.w3.org/1999/02/22-rdf-syntax-ns#> .

<aff4://stream> rdf:type aff4:ImageStream ;
    aff4:chunkSize "10"^^<http://www.w3.org/2001/XMLSchema#int> .
"#;
        let mut store = TripleStore::new();
        load(&mut store, turtle.as_bytes()).unwrap();

        let stream = Urn::new("aff4://stream");
        assert_eq!(
            store.get(&stream, lexicon::AFF4_IMAGE_CHUNK_SIZE),
            Some(&RdfValue::Integer(10))
        );
    }

    #[test]
    fn test_dump_is_parseable_by_rio() {
        let store = sample_store();
        let mut buffer = Vec::new();
        dump(&store, Lexicon::Standard, &mut buffer, false).unwrap();

        let mut triples = 0;
        let mut parser = TurtleParser::new(buffer.as_slice(), None);
        parser
            .parse_all(&mut |_| -> std::result::Result<(), TurtleError> {
                triples += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(triples, 4);
    }
}
