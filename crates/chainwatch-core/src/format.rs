//! Hex quantity helpers for the `0x`-encoded numbers used on the wire.

use serde::{Deserialize, Deserializer, Serializer};

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Encode a u64 as a minimal `0x` quantity.
pub fn to_hex(n: u64) -> String {
    format!("0x{n:x}")
}

/// Compare two `0x` hashes ignoring case.
pub fn same_hash(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// `#[serde(with = "quantity")]` for `u64` fields.
pub mod quantity {
    use super::*;

    pub fn serialize<S: Serializer>(n: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&to_hex(*n))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        parse_hex_u64(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid hex quantity: {raw}")))
    }
}

/// `#[serde(with = "opt_quantity")]` for `Option<u64>` fields.
pub mod opt_quantity {
    use super::*;

    pub fn serialize<S: Serializer>(n: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match n {
            Some(n) => s.serialize_str(&to_hex(*n)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(raw) => parse_hex_u64(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid hex quantity: {raw}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1"), Some(1));
        assert_eq!(parse_hex_u64("0xff"), Some(255));
        assert_eq!(parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(parse_hex_u64("0x"), None);
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn to_hex_is_minimal() {
        assert_eq!(to_hex(0), "0x0");
        assert_eq!(to_hex(4096), "0x1000");
    }

    #[test]
    fn hashes_compare_case_insensitively() {
        assert!(same_hash("0xABcd", "0xabCD"));
        assert!(!same_hash("0xabcd", "0xabce"));
    }
}
