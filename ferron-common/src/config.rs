//! Shared configuration primitives (§6.1). Kept deliberately small: the
//! per-façade option structs (`HttpCacheConfig`, `FilterCacheConfig`,
//! `EncodingCacheConfig`) live next to the façade that uses them, not here.
//! This module only holds the one type all three share, a human-writable
//! byte-size value, in the struct-based configuration style of
//! `ferron_common::config` (stripped of that module's routing/conditional-
//! match machinery, which belongs to the request-routing layer, not the
//! cache).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A byte size, writable in config either as a plain integer or as a
/// human string like `"512KiB"` / `"2MiB"` / `"1GiB"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn bytes(n: u64) -> Self {
        Self(n)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u64>() {
            return Ok(ByteSize(n));
        }

        let (digits, unit) = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .map(|idx| s.split_at(idx))
            .ok_or_else(|| format!("invalid byte size: {s:?}"))?;

        let value: f64 = digits
            .parse()
            .map_err(|_| format!("invalid byte size: {s:?}"))?;

        let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
            "b" | "" => 1,
            "kib" | "k" => 1024,
            "mib" | "m" => 1024 * 1024,
            "gib" | "g" => 1024 * 1024 * 1024,
            other => return Err(format!("unknown byte size unit: {other:?}")),
        };

        Ok(ByteSize((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(ByteSize(n)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_integer() {
        assert_eq!("1024".parse::<ByteSize>().unwrap(), ByteSize(1024));
    }

    #[test]
    fn parses_kib_mib_gib_suffixes() {
        assert_eq!("512KiB".parse::<ByteSize>().unwrap(), ByteSize(512 * 1024));
        assert_eq!("2MiB".parse::<ByteSize>().unwrap(), ByteSize(2 * 1024 * 1024));
        assert_eq!(
            "1GiB".parse::<ByteSize>().unwrap(),
            ByteSize(1024 * 1024 * 1024)
        );
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!("5QiB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn deserializes_from_json_number_or_string() {
        let from_number: ByteSize = serde_json::from_str("2097152").unwrap();
        assert_eq!(from_number, ByteSize(2 * 1024 * 1024));
        let from_text: ByteSize = serde_json::from_str("\"2MiB\"").unwrap();
        assert_eq!(from_text, ByteSize(2 * 1024 * 1024));
    }
}
