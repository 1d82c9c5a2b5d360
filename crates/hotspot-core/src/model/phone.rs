// ── Phone numbers ──
//
// Stored in E.164 (`+6281234567890`). The hotspot username is the local
// form (`081234567890`) because that is what users type on the login page.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const COUNTRY_CODE: &str = "62";
const E164_DIGITS: std::ops::RangeInclusive<usize> = 11..=13;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Local dialing form used as the hotspot username.
    pub fn localized(&self) -> String {
        match self.0.strip_prefix(&format!("+{COUNTRY_CODE}")) {
            Some(rest) => format!("0{rest}"),
            None => self.0.trim_start_matches('+').to_owned(),
        }
    }
}

/// Normalize user input into E.164.
///
/// Accepts `08…`, `8…`, `62…` and `+…` forms with spaces, dashes, dots or
/// parentheses. The result must carry 11 to 13 digits after the `+`.
pub fn normalize_to_e164(raw: &str) -> Result<PhoneNumber, CoreError> {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '+'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::validation("phone", "phone number must contain digits only"));
    }

    let e164_digits = if has_plus || digits.starts_with(COUNTRY_CODE) {
        digits
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("{COUNTRY_CODE}{rest}")
    } else if digits.starts_with('8') {
        format!("{COUNTRY_CODE}{digits}")
    } else {
        return Err(CoreError::validation(
            "phone",
            format!("cannot infer country for '{trimmed}'"),
        ));
    };

    if !E164_DIGITS.contains(&e164_digits.len()) {
        return Err(CoreError::validation(
            "phone",
            format!("'{trimmed}' has an invalid length"),
        ));
    }
    Ok(PhoneNumber(format!("+{e164_digits}")))
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        normalize_to_e164(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(phone: PhoneNumber) -> Self {
        phone.0
    }
}
