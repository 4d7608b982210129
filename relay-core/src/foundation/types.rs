use crate::foundation::error::RelayError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dense per-account identifier assigned by the persistence layer.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Uid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Syntax-checked decentralized identifier.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        if raw.len() > 2048 {
            return Err(RelayError::BadDid(format!("too long: {} chars", raw.len())));
        }
        let rest = raw.strip_prefix("did:").ok_or_else(|| RelayError::BadDid(raw.to_string()))?;
        let (method, id) = rest.split_once(':').ok_or_else(|| RelayError::BadDid(raw.to_string()))?;
        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
            return Err(RelayError::BadDid(raw.to_string()));
        }
        if id.is_empty() || id.ends_with(':') {
            return Err(RelayError::BadDid(raw.to_string()));
        }
        let ok = id.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':' | b'%'));
        if !ok {
            return Err(RelayError::BadDid(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Did {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

const TID_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";
const TID_LEN: usize = 13;
const CLOCK_ID_BITS: u64 = 10;

/// Timestamp identifier: 13 chars of base32-sortable encoding over a 64-bit
/// value (53 bits of microseconds since the UNIX epoch, 10 bits of clock id,
/// top bit zero). Ordering of the string form equals ordering of the value.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(String);

impl Tid {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        if raw.len() != TID_LEN {
            return Err(RelayError::BadRev(format!("expected {TID_LEN} chars, got {}", raw.len())));
        }
        for (i, b) in raw.bytes().enumerate() {
            let Some(idx) = tid_char_index(b) else {
                return Err(RelayError::BadRev(raw.to_string()));
            };
            // The first char carries only 4 payload bits; the top bit stays zero.
            if i == 0 && idx > 0x0F {
                return Err(RelayError::BadRev(raw.to_string()));
            }
        }
        Ok(Self(raw.to_string()))
    }

    /// Builds a TID from its components. Used by key tooling and fixtures.
    pub fn from_parts(micros: u64, clock_id: u16) -> Self {
        let value = (micros << CLOCK_ID_BITS) | u64::from(clock_id & 0x3FF);
        let mut out = String::with_capacity(TID_LEN);
        for i in 0..TID_LEN {
            let shift = 60 - 5 * i as u64;
            let idx = ((value >> shift) & 0x1F) as usize;
            out.push(TID_ALPHABET[idx] as char);
        }
        Self(out)
    }

    fn value(&self) -> u64 {
        let mut v = 0u64;
        for (i, b) in self.0.bytes().enumerate() {
            let idx = tid_char_index(b).expect("validated at parse") as u64;
            v |= idx << (60 - 5 * i as u64);
        }
        v
    }

    /// Microseconds since the UNIX epoch.
    pub fn timestamp_micros(&self) -> u64 {
        self.value() >> CLOCK_ID_BITS
    }

    pub fn time(&self) -> DateTime<Utc> {
        let micros = self.timestamp_micros().min(i64::MAX as u64) as i64;
        Utc.timestamp_micros(micros).single().unwrap_or_else(Utc::now)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Tid {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn tid_char_index(b: u8) -> Option<u8> {
    match b {
        b'2'..=b'7' => Some(b - b'2'),
        b'a'..=b'z' => Some(b - b'a' + 6),
        _ => None,
    }
}

/// A repo record path, `collection/rkey`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RecordPath {
    pub collection: String,
    pub rkey: String,
}

impl RecordPath {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let (collection, rkey) = raw.split_once('/').ok_or_else(|| RelayError::BadPath(raw.to_string()))?;
        if !valid_nsid(collection) || !valid_rkey(rkey) {
            return Err(RelayError::BadPath(raw.to_string()));
        }
        Ok(Self { collection: collection.to_string(), rkey: rkey.to_string() })
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.rkey)
    }
}

fn valid_nsid(s: &str) -> bool {
    if s.is_empty() || s.len() > 317 {
        return false;
    }
    let segments: Vec<&str> = s.split('.').collect();
    if segments.len() < 3 {
        return false;
    }
    segments.iter().all(|seg| {
        !seg.is_empty()
            && seg.as_bytes()[0].is_ascii_alphabetic()
            && seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

fn valid_rkey(s: &str) -> bool {
    if s.is_empty() || s.len() > 512 || s == "." || s == ".." {
        return false;
    }
    s.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'~' | b':' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_accepts_plc_and_web() {
        assert!(Did::parse("did:plc:ewvi7nxzyoun6zhxrhs64oiz").is_ok());
        assert!(Did::parse("did:web:example.com").is_ok());
        assert!(Did::parse("plc:no-prefix").is_err());
        assert!(Did::parse("did:PLC:upper-method").is_err());
        assert!(Did::parse("did:plc:").is_err());
        assert!(Did::parse("did:plc:bad space").is_err());
    }

    #[test]
    fn tid_round_trips_and_sorts() {
        let a = Tid::from_parts(1_700_000_000_000_000, 17);
        let parsed = Tid::parse(a.as_str()).expect("round trip");
        assert_eq!(parsed.timestamp_micros(), 1_700_000_000_000_000);

        let later = Tid::from_parts(1_700_000_000_000_001, 0);
        assert!(later > a);
        assert!(later.as_str() > a.as_str());
    }

    #[test]
    fn tid_rejects_bad_forms() {
        assert!(Tid::parse("short").is_err());
        assert!(Tid::parse("3k2aaaaaaaaa!").is_err());
        // 'z' first char would set the top bit
        assert!(Tid::parse("zaaaaaaaaaaaa").is_err());
    }

    #[test]
    fn record_path_parses() {
        let p = RecordPath::parse("app.bsky.feed.post/3k2akusvhgl2e").expect("path");
        assert_eq!(p.collection, "app.bsky.feed.post");
        assert_eq!(p.rkey, "3k2akusvhgl2e");

        assert!(RecordPath::parse("nodot/rkey").is_err());
        assert!(RecordPath::parse("app.bsky.feed.post").is_err());
        assert!(RecordPath::parse("app.bsky.feed.post/").is_err());
        assert!(RecordPath::parse("app.bsky.feed.post/..").is_err());
    }
}
