// ── MAC address ──
//
// Canonical form is uppercase, colon-separated (`AA:BB:CC:DD:EE:FF`), the
// form RouterOS prints. Input may arrive percent-encoded (sometimes twice,
// when a captive-portal redirect re-encodes the query string), hyphenated,
// dotted or bare.

use std::fmt;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Normalize a raw MAC into canonical form.
pub fn normalize_mac(raw: &str) -> Result<MacAddress, CoreError> {
    let mut value = raw.trim().to_owned();
    // at most three rounds of decoding: `%253A` → `%3A` → `:`
    for _ in 0..3 {
        if !value.contains('%') {
            break;
        }
        value = percent_decode_str(&value).decode_utf8_lossy().into_owned();
    }

    let hex: String = value
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreError::validation(
            "mac",
            format!("'{}' is not a valid MAC address", raw.trim()),
        ));
    }

    let upper = hex.to_ascii_uppercase();
    let octets: Vec<&str> = (0..6).filter_map(|i| upper.get(i * 2..i * 2 + 2)).collect();
    Ok(MacAddress(octets.join(":")))
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MacAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize_mac(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        normalize_mac(&value)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}
