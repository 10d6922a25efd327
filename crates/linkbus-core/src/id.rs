//! Identity types for the broker
//!
//! A link identifies itself with a `DsId`: a human-readable name followed by
//! the URL-safe base64 SHA-256 hash of its public key. Connections and
//! requests are numbered by the broker.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{BrokerError, BrokerResult};

/// Length of the public key hash segment at the end of every `DsId`
pub const PUB_KEY_HASH_LEN: usize = 43;

/// Separator allowed between the display name and the hash segment
pub const DS_ID_SEPARATOR: char = '-';

/// Link identifier: `<displayName>[-]<43-char URL-safe base64 hash>`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DsId {
    raw: String,
    name_len: usize,
}

impl DsId {
    /// Parse and validate an identifier
    pub fn parse(raw: &str) -> BrokerResult<Self> {
        if raw.len() <= PUB_KEY_HASH_LEN {
            return Err(BrokerError::InvalidIdentifier(format!(
                "identifier shorter than {} characters",
                PUB_KEY_HASH_LEN + 1
            )));
        }

        let split = raw.len() - PUB_KEY_HASH_LEN;
        if !raw.is_char_boundary(split) {
            return Err(BrokerError::InvalidIdentifier(raw.to_string()));
        }

        let (prefix, hash) = raw.split_at(split);
        if !hash.bytes().all(is_url_safe_base64) {
            return Err(BrokerError::InvalidIdentifier(format!(
                "hash segment of {raw} is not URL-safe base64"
            )));
        }

        let name = prefix.strip_suffix(DS_ID_SEPARATOR).unwrap_or(prefix);
        if name.is_empty() {
            return Err(BrokerError::InvalidIdentifier(format!(
                "empty display name in {raw}"
            )));
        }

        Ok(DsId {
            raw: raw.to_string(),
            name_len: name.len(),
        })
    }

    /// Build an identifier from a display name and a key hash
    pub fn compose(name: &str, pub_key_hash: &str) -> BrokerResult<Self> {
        Self::parse(&format!("{name}{DS_ID_SEPARATOR}{pub_key_hash}"))
    }

    /// Full identifier text
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The trailing 43-character public key hash
    #[inline]
    pub fn hash_segment(&self) -> &str {
        &self.raw[self.raw.len() - PUB_KEY_HASH_LEN..]
    }

    /// Display name (prefix without the optional separator)
    #[inline]
    pub fn display_name(&self) -> &str {
        &self.raw[..self.name_len]
    }
}

fn is_url_safe_base64(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

impl fmt::Debug for DsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DsId({})", self.raw)
    }
}

impl fmt::Display for DsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Connection identity - assigned by the broker, never reused
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const ZERO: SessionId = SessionId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({:016x})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Request identity ("rid") - unique per connection and direction
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u32);

impl RequestId {
    #[inline]
    pub fn new(id: u32) -> Self {
        RequestId(id)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rid({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HASH: &str = "Sv7Z1vAaIO0Q8xHo-j3bQcJ8mLSJ1p3n6dWlqKxdEjE";

    #[test]
    fn test_parse_with_separator() {
        let id = DsId::parse(&format!("thermostat-{HASH}")).unwrap();
        assert_eq!(id.display_name(), "thermostat");
        assert_eq!(id.hash_segment(), HASH);
    }

    #[test]
    fn test_parse_without_separator() {
        let id = DsId::parse(&format!("sensor{HASH}")).unwrap();
        assert_eq!(id.display_name(), "sensor");
    }

    #[test]
    fn test_only_one_separator_stripped() {
        let id = DsId::parse(&format!("my-link--{HASH}")).unwrap();
        assert_eq!(id.display_name(), "my-link-");
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            DsId::parse(&format!("-{HASH}")),
            Err(BrokerError::InvalidIdentifier(_))
        ));
        assert!(DsId::parse(HASH).is_err());
    }

    #[test]
    fn test_bad_hash_alphabet_rejected() {
        let bad = format!("link-{}+", &HASH[..42]);
        assert!(DsId::parse(&bad).is_err());
    }

    #[test]
    fn test_multibyte_boundary_rejected() {
        // 'é' straddles the hash boundary
        let raw = format!("é{}", &HASH[1..]);
        assert!(DsId::parse(&format!("x{raw}")).is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_ids_split_correctly(
            name in "[a-zA-Z0-9_]{1,24}",
            hash in "[A-Za-z0-9_-]{43}",
            sep in proptest::bool::ANY,
        ) {
            let raw = if sep { format!("{name}-{hash}") } else { format!("{name}{hash}") };
            let id = DsId::parse(&raw).unwrap();
            prop_assert!(!id.display_name().is_empty());
            prop_assert_eq!(id.hash_segment(), &raw[raw.len() - 43..]);
            prop_assert_eq!(id.hash_segment().len(), PUB_KEY_HASH_LEN);
        }
    }
}
