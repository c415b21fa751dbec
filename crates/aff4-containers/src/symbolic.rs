//! Symbolic pseudo-streams
//!
//! Pattern-recognized URNs that open to infinite, read-only, seekable
//! streams: zeros, a repeated byte value, or a repeated marker string
//! pre-materialized to an exact 1 MiB tile. Which patterns are recognized
//! depends on the lexicon generation.

use aff4_core::lexicon::AFF4_NAMESPACE;
use aff4_core::{Error, Lexicon, Result, Urn};

const AFFLIB_2012_SYMBOLIC: &str = "http://afflib.org/2012/SymbolicStream#";
const TILE_SIZE: usize = 1024 * 1024;

/// Make exactly 1 MiB tile of the repeated string.
fn make_tile(repeated: &[u8]) -> Vec<u8> {
    let mut tile = Vec::with_capacity(TILE_SIZE);
    while tile.len() + repeated.len() <= TILE_SIZE {
        tile.extend_from_slice(repeated);
    }
    tile.extend_from_slice(&repeated[..TILE_SIZE - tile.len()]);
    tile
}

fn is_two_hex_digits(name: &str) -> bool {
    name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit())
}

fn parse_hex_byte(name: &str) -> Option<u8> {
    if is_two_hex_digits(name) {
        u8::from_str_radix(name, 16).ok()
    } else {
        None
    }
}

fn fixed_symbolics(base: &str) -> [String; 4] {
    [
        format!("{}Zero", base),
        format!("{}UnknownData", base),
        format!("{}UnreadableData", base),
        format!("{}NoData", base),
    ]
}

/// Does this URN name a symbolic stream under the given lexicon?
pub fn is_symbolic(urn: &str, flavor: Lexicon) -> bool {
    if !urn.starts_with("http://") {
        return false;
    }
    let base = base_namespace(flavor);

    if fixed_symbolics(base).iter().any(|fixed| fixed == urn) {
        return true;
    }
    if urn.starts_with(&format!("{}SymbolicStream", base)) {
        return true;
    }

    if flavor == Lexicon::Legacy {
        if urn == format!("{}FF", base) {
            return true;
        }
        // Pre-standard Evimetry symbolic streams live directly under the
        // base namespace as two hex digits.
        if let Some(tail) = urn.strip_prefix(base) {
            if is_two_hex_digits(&tail.to_uppercase()) {
                return true;
            }
        }
        if urn.starts_with(AFFLIB_2012_SYMBOLIC) {
            return true;
        }
    }

    false
}

fn base_namespace(flavor: Lexicon) -> &'static str {
    match flavor {
        Lexicon::Legacy => aff4_core::lexicon::AFF4_LEGACY_NAMESPACE,
        _ => AFF4_NAMESPACE,
    }
}

/// Instantiate the symbolic stream for a recognized URN.
pub fn create(urn: &Urn, flavor: Lexicon) -> Result<SymbolicStream> {
    let value = urn.as_str();
    let base = base_namespace(flavor);

    if value == format!("{}Zero", base) {
        return Ok(SymbolicStream::repeated_byte(urn.clone(), 0));
    }
    if value == format!("{}UnknownData", base) {
        return Ok(SymbolicStream::tiled(urn.clone(), make_tile(b"UNKNOWN")));
    }
    if value == format!("{}UnreadableData", base) {
        return Ok(SymbolicStream::tiled(
            urn.clone(),
            make_tile(b"UNREADABLEDATA"),
        ));
    }

    if let Some(tail) = value.strip_prefix(&format!("{}SymbolicStream", base)) {
        if let Some(byte) = parse_hex_byte(&tail.to_uppercase()) {
            return Ok(SymbolicStream::repeated_byte(urn.clone(), byte));
        }
    }

    if flavor == Lexicon::Legacy {
        if value == format!("{}FF", base) {
            return Ok(SymbolicStream::repeated_byte(urn.clone(), 0xFF));
        }
        if let Some(tail) = value.strip_prefix(AFFLIB_2012_SYMBOLIC) {
            if let Some(byte) = parse_hex_byte(&tail.to_uppercase()) {
                return Ok(SymbolicStream::repeated_byte(urn.clone(), byte));
            }
        }
        if let Some(tail) = value.strip_prefix(base) {
            if let Some(byte) = parse_hex_byte(&tail.to_uppercase()) {
                return Ok(SymbolicStream::repeated_byte(urn.clone(), byte));
            }
        }
    }

    Err(Error::not_found(format!(
        "no symbolic stream for {}",
        value
    )))
}

/// An infinite, read-only stream repeating a tile of bytes.
pub struct SymbolicStream {
    urn: Urn,
    tile: Vec<u8>,
    readptr: u64,
}

impl SymbolicStream {
    fn repeated_byte(urn: Urn, byte: u8) -> Self {
        Self {
            urn,
            tile: vec![byte],
            readptr: 0,
        }
    }

    fn tiled(urn: Urn, tile: Vec<u8>) -> Self {
        Self {
            urn,
            tile,
            readptr: 0,
        }
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    pub fn readptr(&self) -> u64 {
        self.readptr
    }

    pub fn set_readptr(&mut self, offset: u64) {
        self.readptr = offset;
    }

    /// Reported as the maximum representable positive offset.
    pub fn size(&self) -> u64 {
        i64::MAX as u64
    }

    pub fn read(&mut self, length: usize) -> Vec<u8> {
        let tile_len = self.tile.len() as u64;
        let mut result = Vec::with_capacity(length);
        while result.len() < length {
            let offset_in_tile = (self.readptr % tile_len) as usize;
            let available = self.tile.len() - offset_in_tile;
            let wanted = (length - result.len()).min(available);
            result.extend_from_slice(&self.tile[offset_in_tile..offset_in_tile + wanted]);
            self.readptr += wanted as u64;
        }
        result
    }

    pub fn write(&mut self) -> Result<usize> {
        Err(Error::programmer(format!(
            "symbolic stream {} is read-only",
            self.urn
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_stream() {
        let urn = Urn::new("http://aff4.org/Schema#Zero");
        assert!(is_symbolic(urn.as_str(), Lexicon::Standard));
        let mut stream = create(&urn, Lexicon::Standard).unwrap();
        assert_eq!(stream.read(8), vec![0u8; 8]);
        assert_eq!(stream.size(), i64::MAX as u64);
    }

    #[test]
    fn test_symbolic_stream_hex_byte() {
        let urn = Urn::new("http://aff4.org/Schema#SymbolicStreamAB");
        assert!(is_symbolic(urn.as_str(), Lexicon::Standard));
        let mut stream = create(&urn, Lexicon::Standard).unwrap();
        assert_eq!(stream.read(4), vec![0xAB; 4]);
    }

    #[test]
    fn test_unknown_data_tiles() {
        let urn = Urn::new("http://aff4.org/Schema#UnknownData");
        let mut stream = create(&urn, Lexicon::Standard).unwrap();
        assert_eq!(stream.read(7), b"UNKNOWN".to_vec());
        // Reads continue seamlessly across the tile boundary.
        stream.set_readptr(1024 * 1024 - 3);
        let chunk = stream.read(10);
        assert_eq!(chunk.len(), 10);
    }

    #[test]
    fn test_prestd_direct_hex() {
        let urn = "http://afflib.org/2009/aff4#FF";
        assert!(is_symbolic(urn, Lexicon::Legacy));
        assert!(!is_symbolic(urn, Lexicon::Standard));

        let mut stream = create(&Urn::new(urn), Lexicon::Legacy).unwrap();
        assert_eq!(stream.read(2), vec![0xFF, 0xFF]);

        let hex = "http://afflib.org/2009/aff4#1f";
        assert!(is_symbolic(hex, Lexicon::Legacy));
        let mut stream = create(&Urn::new(hex), Lexicon::Legacy).unwrap();
        assert_eq!(stream.read(1), vec![0x1F]);
    }

    #[test]
    fn test_afflib_2012_namespace() {
        let urn = "http://afflib.org/2012/SymbolicStream#00";
        assert!(is_symbolic(urn, Lexicon::Legacy));
        let mut stream = create(&Urn::new(urn), Lexicon::Legacy).unwrap();
        assert_eq!(stream.read(3), vec![0, 0, 0]);
    }

    #[test]
    fn test_aff4_urns_are_not_symbolic() {
        assert!(!is_symbolic("aff4://0a860b9e", Lexicon::Standard));
        assert!(!is_symbolic("file:///tmp/x", Lexicon::Legacy));
    }

    #[test]
    fn test_write_is_programmer_error() {
        let urn = Urn::new("http://aff4.org/Schema#Zero");
        let mut stream = create(&urn, Lexicon::Standard).unwrap();
        assert!(stream.write().is_err());
    }
}
