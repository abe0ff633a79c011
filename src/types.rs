// SPDX-License-Identifier: Apache-2.0

//! Identifier and span types shared by providers, backends and clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// 128-bit target identifier, generated by the provider when a target is
/// registered. Displays as the canonical 36-character hyphenated form and
/// serializes as 16 raw bytes in binary formats.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct TargetId(Uuid);

impl TargetId {
    /// Mint a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TargetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Config(format!("invalid target id \"{s}\": {e}")))
    }
}

/// Opaque region identifier minted by the owning backend. The provider never
/// parses it; it is compared by value and serialized verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RegionId(Vec<u8>);

impl RegionId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex form used for logging and for backends that name files after
    /// region ids.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(self.0.len() * 2);
        for b in &self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Parse the hex form produced by [`RegionId::to_hex`].
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Backend(format!("invalid region id encoding \"{hex}\"")));
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or(0))
            .collect();
        Ok(Self(bytes))
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Vec<u8>> for RegionId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A contiguous byte range inside a region. Span lists apply in list order;
/// zero-length spans are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub offset: u64,
    pub len: u64,
}

impl Span {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }
}

/// Total number of bytes covered by a span list.
pub fn span_total(spans: &[Span]) -> u64 {
    spans.iter().map(|s| s.len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_id_string_roundtrip() {
        let id = TargetId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(s.parse::<TargetId>().unwrap(), id);
    }

    #[test]
    fn test_target_id_parse_rejects_garbage() {
        assert!(matches!(
            "not-a-uuid".parse::<TargetId>(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_target_ids_are_distinct() {
        let a = TargetId::generate();
        let b = TargetId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_region_id_hex_roundtrip() {
        let id = RegionId::new(vec![0x00, 0xab, 0xff, 0x10]);
        assert_eq!(id.to_hex(), "00abff10");
        assert_eq!(RegionId::from_hex("00abff10").unwrap(), id);
    }

    #[test]
    fn test_region_id_from_hex_rejects_garbage() {
        assert!(RegionId::from_hex("zz").is_err());
        assert!(RegionId::from_hex("abc").is_err());
    }

    #[test]
    fn test_region_id_wire_roundtrip() {
        let id = RegionId::new(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let bytes = rmp_serde::to_vec(&id).unwrap();
        let back: RegionId = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_span_total() {
        let spans = [Span::new(0, 10), Span::new(100, 0), Span::new(50, 6)];
        assert_eq!(span_total(&spans), 16);
        assert_eq!(span_total(&[]), 0);
    }
}
