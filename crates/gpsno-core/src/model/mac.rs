// ── Hardware address ──
//
// Stations are identified by their MAC address in canonical form:
// lower-case, colon-separated (`aa:bb:cc:dd:ee:ff`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const OCTETS: usize = 6;

/// A validated MAC address in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    /// Bring a raw address into canonical form without validating it.
    ///
    /// Trims, lower-cases, turns dashes into colons, and expands 12 bare hex
    /// digits into the colon-separated form. Anything else is returned as-is
    /// (lower-cased), so applying it twice changes nothing.
    pub fn normalize(raw: &str) -> String {
        let lowered = raw.trim().to_lowercase().replace('-', ":");
        if lowered.len() == 2 * OCTETS && lowered.chars().all(|c| c.is_ascii_hexdigit()) {
            let pairs: Vec<&str> = (0..OCTETS).map(|i| &lowered[2 * i..2 * i + 2]).collect();
            return pairs.join(":");
        }
        lowered
    }

    /// Normalize and validate.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, CoreError> {
        let raw = raw.as_ref();
        if raw.trim().is_empty() {
            return Err(CoreError::validation("missing hardware address"));
        }

        let normalized = Self::normalize(raw);
        let valid = normalized.split(':').count() == OCTETS
            && normalized
                .split(':')
                .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(CoreError::validation(format!(
                "invalid hardware address '{raw}'"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The six octets without separators: `aabbccddeeff`.
    pub fn compact(&self) -> String {
        self.0.replace(':', "")
    }

    /// Upper-cased last three octets: `DDEEFF`.
    pub fn suffix(&self) -> String {
        let compact = self.compact();
        compact[compact.len() - 6..].to_uppercase()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MacAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bare_hex_is_expanded() {
        let mac = MacAddress::parse("AABBCCDDEEFF").unwrap();
        assert_eq!(mac.as_str(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(mac.compact(), "aabbccddeeff");
        assert_eq!(mac.suffix(), "DDEEFF");
    }

    #[test]
    fn dashes_and_case_are_normalized() {
        let mac: MacAddress = " AA-BB-CC-dd-ee-FF ".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["AABBCCDDEEFF", "aa:bb:cc:dd:ee:ff", "AA-BB-CC-DD-EE-FF", "garbage", ""] {
            let once = MacAddress::normalize(raw);
            assert_eq!(MacAddress::normalize(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn rejects_missing_and_malformed() {
        assert!(matches!(
            MacAddress::parse("  "),
            Err(CoreError::ValidationFailed { .. })
        ));
        assert!(MacAddress::parse("aa:bb:cc").is_err());
        assert!(MacAddress::parse("zz:bb:cc:dd:ee:ff").is_err());
        assert!(MacAddress::parse("aabbccddeeff00").is_err());
    }
}
