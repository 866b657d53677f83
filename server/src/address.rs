//! Bech32 account addresses.
//!
//! Owners and providers are identified by a bech32 string such as
//! `akash1...`. The same string appears as the Subject and Issuer
//! CommonName of every owner certificate, so parsing it is the first gate of
//! peer verification.

use std::fmt;
use std::str::FromStr;

use bech32::{Bech32, Hrp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Human-readable prefix used when none is configured.
pub const DEFAULT_HRP: &str = "akash";

const MAX_PAYLOAD_LEN: usize = 255;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("invalid bech32 encoding: {0}")]
    Encoding(String),
    #[error("expected prefix {expected:?}, got {actual:?}")]
    Prefix { expected: String, actual: String },
    #[error("address payload must be 1..={MAX_PAYLOAD_LEN} bytes, got {0}")]
    Length(usize),
}

/// A validated bech32 account address.
///
/// The canonical encoding is kept alongside the raw payload so comparisons
/// and display never re-encode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountAddress {
    encoded: String,
    payload: Vec<u8>,
}

impl AccountAddress {
    /// Parse `s` and require its human-readable part to equal `hrp`.
    pub fn parse_with_prefix(s: &str, hrp: &str) -> Result<Self, AddressError> {
        let addr = Self::parse_any(s)?;
        let actual = addr.prefix();
        if actual != hrp {
            return Err(AddressError::Prefix {
                expected: hrp.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(addr)
    }

    /// Parse `s` accepting any human-readable part.
    pub fn parse_any(s: &str) -> Result<Self, AddressError> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let (hrp, payload) = bech32::decode(s).map_err(|e| AddressError::Encoding(e.to_string()))?;
        Self::from_parts(&hrp, payload)
    }

    /// Encode `payload` under `hrp`.
    pub fn from_payload(hrp: &str, payload: &[u8]) -> Result<Self, AddressError> {
        let hrp = Hrp::parse(hrp).map_err(|e| AddressError::Encoding(e.to_string()))?;
        Self::from_parts(&hrp, payload.to_vec())
    }

    fn from_parts(hrp: &Hrp, payload: Vec<u8>) -> Result<Self, AddressError> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN {
            return Err(AddressError::Length(payload.len()));
        }
        let encoded = bech32::encode::<Bech32>(*hrp, &payload)
            .map_err(|e| AddressError::Encoding(e.to_string()))?;
        Ok(Self { encoded, payload })
    }

    /// The human-readable part, e.g. `akash`.
    pub fn prefix(&self) -> &str {
        self.encoded
            .rsplit_once('1')
            .map_or(self.encoded.as_str(), |(hrp, _)| hrp)
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl FromStr for AccountAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_any(s)
    }
}

impl Serialize for AccountAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

impl<'de> Deserialize<'de> for AccountAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_any(&s).map_err(serde::de::Error::custom)
    }
}
