//! RDF values: URNs and typed literals
//!
//! These are responsible for serialization. A `Urn` is stored in canonical
//! form (`scheme://netloc/path`); `http://` URNs keep their path untouched
//! at parse time, everything else is posix-normalized.

use crate::error::{Error, Result};
use crate::hashes::HashKind;

/// Characters that survive percent-quoting unescaped.
fn is_unreserved(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'-' | b'.' | b'_' | b'~' | b'/')
}

fn quote(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for byte in component.bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02x}", byte));
        }
    }
    out
}

/// Collapse a path onto a segment stack: empty and `.` segments drop,
/// `..` pops (clamped at the root).
fn normalize_segments(path: &str) -> Vec<String> {
    let mut stack: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other.to_string()),
        }
    }
    stack
}

/// Parsed components of a URN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrnParts {
    pub scheme: String,
    pub netloc: String,
    pub path: String,
    /// Query/fragment tail, kept verbatim (including the leading `?`/`#`).
    pub suffix: String,
}

impl UrnParts {
    fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.scheme);
        out.push_str("://");
        out.push_str(&self.netloc);
        if !self.path.is_empty() && !self.path.starts_with('/') {
            out.push('/');
        }
        out.push_str(&self.path);
        out.push_str(&self.suffix);
        out
    }
}

/// An absolute resource identifier.
///
/// Two schemes are meaningful: `aff4://<uuid>` for logical objects and
/// `file://<path>` for filesystem-backed storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Urn {
    value: String,
}

impl Urn {
    pub fn new(value: impl AsRef<str>) -> Self {
        let parts = Self::parse_value(value.as_ref());
        Self {
            value: parts.serialize(),
        }
    }

    /// A fresh `aff4://<uuid4>` URN.
    pub fn new_unique() -> Self {
        Self::new(format!("aff4://{}", uuid::Uuid::new_v4()))
    }

    /// Map a filesystem path to a `file://` URN. `to_filename` is the
    /// exact inverse.
    pub fn from_filename(path: impl AsRef<str>) -> Self {
        Self::new(format!("file://{}", path.as_ref()))
    }

    /// The filesystem path for `file://` URNs, `None` otherwise.
    pub fn to_filename(&self) -> Option<String> {
        let parts = self.parse();
        if parts.scheme == "file" {
            Some(format!("{}{}", parts.netloc, parts.path))
        } else {
            None
        }
    }

    pub fn parse(&self) -> UrnParts {
        Self::parse_value(&self.value)
    }

    fn parse_value(value: &str) -> UrnParts {
        let (scheme, rest) = match value.split_once("://") {
            Some((scheme, rest)) => (scheme.to_string(), rest),
            // A bare filesystem path.
            None => {
                return UrnParts {
                    scheme: "file".to_string(),
                    netloc: String::new(),
                    path: value.to_string(),
                    suffix: String::new(),
                };
            }
        };

        let (netloc, path_and_suffix) = match rest.find(['/', '?', '#']) {
            Some(idx) => (rest[..idx].to_string(), &rest[idx..]),
            None => (rest.to_string(), ""),
        };

        let (path, suffix) = match path_and_suffix.find(['?', '#']) {
            Some(idx) => (
                path_and_suffix[..idx].to_string(),
                path_and_suffix[idx..].to_string(),
            ),
            None => (path_and_suffix.to_string(), String::new()),
        };

        // Don't normalise the path of http URIs.
        let path = if scheme == "http" || path.is_empty() {
            path
        } else {
            let absolute = path.starts_with('/');
            let stack = normalize_segments(&path);
            if stack.is_empty() {
                if absolute { "/".to_string() } else { String::new() }
            } else if absolute {
                format!("/{}", stack.join("/"))
            } else {
                stack.join("/")
            }
        };

        UrnParts {
            scheme,
            netloc,
            path,
            suffix,
        }
    }

    pub fn scheme(&self) -> String {
        self.parse().scheme
    }

    /// Join a path component onto this URN, posix-normalizing the result.
    pub fn append(&self, component: &str) -> Urn {
        self.append_quoted(component, true)
    }

    pub fn append_quoted(&self, component: &str, quote_component: bool) -> Urn {
        let parts = self.parse();
        let component = if quote_component {
            quote(component)
        } else {
            component.to_string()
        };
        let component = component.trim_start_matches('/');

        let joined = if parts.path.is_empty() {
            component.to_string()
        } else {
            format!("{}/{}", parts.path, component)
        };

        let stack = normalize_segments(&joined);
        let path = if stack.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", stack.join("/"))
        };

        Urn {
            value: UrnParts {
                path,
                ..parts
            }
            .serialize(),
        }
    }

    /// The suffix of `child` after this URN, or `None` if this URN is not a
    /// prefix of it.
    pub fn relative_path(&self, child: &Urn) -> Option<String> {
        child
            .value
            .strip_prefix(&self.value)
            .map(|tail| tail.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

impl From<&str> for Urn {
    fn from(value: &str) -> Self {
        Urn::new(value)
    }
}

impl From<&Urn> for Urn {
    fn from(value: &Urn) -> Self {
        value.clone()
    }
}

/// A typed RDF literal or resource reference.
///
/// Every value `V` round-trips: `decode(encode(V)) == V`.
#[derive(Debug, Clone, PartialEq)]
pub enum RdfValue {
    /// `xsd:hexBinary` — hex-encoded on the wire.
    Bytes(Vec<u8>),
    /// `xsd:string`
    String(String),
    /// `xsd:integer` / `xsd:int` / `xsd:long`
    Integer(i64),
    /// A resource reference.
    Urn(Urn),
    /// A digest tagged by algorithm; equality requires both to match.
    Hash(HashKind, String),
}

impl RdfValue {
    /// Wire form of the value (without datatype annotation).
    pub fn serialize(&self) -> String {
        match self {
            RdfValue::Bytes(data) => hex::encode(data),
            RdfValue::String(s) => s.clone(),
            RdfValue::Integer(i) => i.to_string(),
            RdfValue::Urn(urn) => urn.to_string(),
            RdfValue::Hash(_, digest) => digest.clone(),
        }
    }

    /// The datatype IRI for literals; `None` for resource references.
    pub fn datatype_iri(&self) -> Option<String> {
        match self {
            RdfValue::Bytes(_) => Some(format!("{}hexBinary", crate::lexicon::XSD_NAMESPACE)),
            RdfValue::String(_) => Some(format!("{}string", crate::lexicon::XSD_NAMESPACE)),
            RdfValue::Integer(_) => Some(format!("{}integer", crate::lexicon::XSD_NAMESPACE)),
            RdfValue::Urn(_) => None,
            RdfValue::Hash(kind, _) => Some(kind.datatype_iri().to_string()),
        }
    }

    /// Decode a typed literal from its wire form. Unknown datatypes decode
    /// as plain strings.
    pub fn parse_typed(datatype: &str, value: &str) -> Result<RdfValue> {
        if let Some(kind) = HashKind::from_datatype_iri(datatype) {
            return Ok(RdfValue::Hash(kind, value.to_string()));
        }

        let local = datatype
            .strip_prefix(crate::lexicon::XSD_NAMESPACE)
            .unwrap_or("");
        match local {
            "hexBinary" => {
                let raw = hex::decode(value)
                    .map_err(|e| Error::format(format!("bad hexBinary literal: {}", e)))?;
                Ok(RdfValue::Bytes(raw))
            }
            "integer" | "int" | "long" => {
                let parsed = value
                    .parse::<i64>()
                    .map_err(|e| Error::format(format!("bad integer literal {:?}: {}", value, e)))?;
                Ok(RdfValue::Integer(parsed))
            }
            "string" => Ok(RdfValue::String(value.to_string())),
            _ => Ok(RdfValue::String(value.to_string())),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RdfValue::Integer(i) => Some(*i),
            RdfValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_urn(&self) -> Option<Urn> {
        match self {
            RdfValue::Urn(urn) => Some(urn.clone()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RdfValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Urn> for RdfValue {
    fn from(urn: Urn) -> Self {
        RdfValue::Urn(urn)
    }
}

impl From<i64> for RdfValue {
    fn from(i: i64) -> Self {
        RdfValue::Integer(i)
    }
}

impl From<&str> for RdfValue {
    fn from(s: &str) -> Self {
        RdfValue::String(s.to_string())
    }
}
