//! Contact URNs
//!
//! A URN identifies one contact endpoint in the form `scheme:path[#display]`.
//! The scheme set is closed; `tel` paths are normalized to E.164 while every
//! other scheme carries an opaque provider identifier. Equality and hashing
//! use the identity (scheme + normalized path) and ignore the display part,
//! so the same contact seen with and without a display name compares equal.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCHEME_TEL: &str = "tel";
pub const SCHEME_EXT: &str = "ext";
pub const SCHEME_FACEBOOK: &str = "facebook";
pub const SCHEME_FCM: &str = "fcm";
pub const SCHEME_INSTAGRAM: &str = "instagram";
pub const SCHEME_JIOCHAT: &str = "jiochat";
pub const SCHEME_LINE: &str = "line";
pub const SCHEME_TELEGRAM: &str = "telegram";
pub const SCHEME_VIBER: &str = "viber";
pub const SCHEME_VK: &str = "vk";
pub const SCHEME_WECHAT: &str = "wechat";
pub const SCHEME_WHATSAPP: &str = "whatsapp";

/// The closed set of schemes Courier will route on.
pub const VALID_SCHEMES: &[&str] = &[
    SCHEME_TEL,
    SCHEME_EXT,
    SCHEME_FACEBOOK,
    SCHEME_FCM,
    SCHEME_INSTAGRAM,
    SCHEME_JIOCHAT,
    SCHEME_LINE,
    SCHEME_TELEGRAM,
    SCHEME_VIBER,
    SCHEME_VK,
    SCHEME_WECHAT,
    SCHEME_WHATSAPP,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrnError {
    #[error("unknown URN scheme: {0}")]
    UnknownScheme(String),

    #[error("empty URN path")]
    EmptyPath,

    #[error("invalid phone number: {0}")]
    InvalidNumber(String),

    #[error("malformed URN: {0}")]
    Malformed(String),
}

fn e164_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+[1-9][0-9]{7,14}$").unwrap())
}

fn sender_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9]*$").unwrap())
}

/// A contact URN, stored in canonical `scheme:path[#display]` form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    /// Builds a URN from parts, validating the scheme.
    pub fn new(scheme: &str, path: &str, display: Option<&str>) -> Result<Self, UrnError> {
        if !VALID_SCHEMES.contains(&scheme) {
            return Err(UrnError::UnknownScheme(scheme.to_string()));
        }
        if path.is_empty() {
            return Err(UrnError::EmptyPath);
        }
        let mut s = format!("{scheme}:{path}");
        if let Some(display) = display.filter(|d| !d.is_empty()) {
            s.push('#');
            s.push_str(display);
        }
        Ok(Urn(s))
    }

    /// Parses a URN from its canonical string form.
    pub fn parse(raw: &str) -> Result<Self, UrnError> {
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| UrnError::Malformed(raw.to_string()))?;
        let (path, display) = match rest.split_once('#') {
            Some((p, d)) => (p, Some(d)),
            None => (rest, None),
        };
        Self::new(scheme, path, display)
    }

    /// Builds a `tel:` URN from a raw phone number, normalizing to E.164.
    ///
    /// Punctuation and whitespace are stripped and an international prefix
    /// (`+` or `00`) is honored. Bare digit strings long enough to already
    /// carry a country code gain a `+`; short digit strings are kept verbatim
    /// as shortcodes, and alphanumeric sender ids pass through untouched.
    pub fn from_tel(raw: &str, country: Option<&str>) -> Result<Self, UrnError> {
        let path = normalize_tel(raw, country)?;
        Self::new(SCHEME_TEL, &path, None)
    }

    pub fn scheme(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    pub fn path(&self) -> &str {
        let rest = self.0.splitn(2, ':').nth(1).unwrap_or("");
        rest.split('#').next().unwrap_or("")
    }

    pub fn display(&self) -> Option<&str> {
        self.0.split_once('#').map(|(_, d)| d)
    }

    /// The identity portion (`scheme:path`), which defines equality.
    pub fn identity(&self) -> &str {
        self.0.split('#').next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Urn {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Urn {}

impl Hash for Urn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_tel(raw: &str, _country: Option<&str>) -> Result<String, UrnError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    if cleaned.is_empty() {
        return Err(UrnError::EmptyPath);
    }

    // international prefix variants
    let candidate = if let Some(rest) = cleaned.strip_prefix("00") {
        format!("+{rest}")
    } else {
        cleaned.clone()
    };

    if let Some(digits) = candidate.strip_prefix('+') {
        let normalized = format!("+{digits}");
        if e164_regex().is_match(&normalized) {
            return Ok(normalized);
        }
        return Err(UrnError::InvalidNumber(raw.to_string()));
    }

    if candidate.chars().all(|c| c.is_ascii_digit()) {
        // long enough to carry a country code already
        if (11..=15).contains(&candidate.len()) {
            let normalized = format!("+{candidate}");
            if e164_regex().is_match(&normalized) {
                return Ok(normalized);
            }
            return Err(UrnError::InvalidNumber(raw.to_string()));
        }
        // shortcodes stay as-is
        if candidate.len() <= 7 {
            return Ok(candidate);
        }
        return Err(UrnError::InvalidNumber(raw.to_string()));
    }

    // alphanumeric sender ids (one-way aggregator senders)
    if sender_id_regex().is_match(&candidate) {
        return Ok(candidate);
    }

    Err(UrnError::InvalidNumber(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_roundtrip() {
        let urn = Urn::parse("telegram:12345#nicpottier").unwrap();
        assert_eq!(urn.scheme(), "telegram");
        assert_eq!(urn.path(), "12345");
        assert_eq!(urn.display(), Some("nicpottier"));
        assert_eq!(urn.identity(), "telegram:12345");
        assert_eq!(urn.to_string(), "telegram:12345#nicpottier");
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert_eq!(
            Urn::parse("smtp:foo@bar.com"),
            Err(UrnError::UnknownScheme("smtp".to_string()))
        );
        assert_eq!(Urn::parse("no-colon-here").is_err(), true);
    }

    #[test]
    fn test_display_ignored_in_equality() {
        let a = Urn::parse("whatsapp:250788383383").unwrap();
        let b = Urn::parse("whatsapp:250788383383#bob").unwrap();
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_tel_normalization() {
        let cases = [
            ("+250 788 383 383", "+250788383383"),
            ("(250) 788-383-383", "+250788383383"),
            ("250788383383", "+250788383383"),
            ("0026547458", "+26547458"),
            ("2020", "2020"),
            ("MTNRWANDA", "MTNRWANDA"),
        ];
        for (raw, expected) in cases {
            let urn = Urn::from_tel(raw, Some("RW")).unwrap();
            assert_eq!(urn.path(), expected, "normalizing {raw}");
        }
    }

    #[test]
    fn test_invalid_tel_rejected() {
        assert!(Urn::from_tel("+0123", None).is_err());
        assert!(Urn::from_tel("++250788383383", None).is_err());
        assert!(Urn::from_tel("12345678", None).is_err()); // too long for a shortcode, too short for E.164
        assert!(Urn::from_tel("", None).is_err());
    }
}
