//! Link-layer addresses and entity identities.
//!
//! Both are fixed-size byte strings on the wire. They are wrapped so the
//! classifier compares whole identities, never partial slices.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// ADP/ACMP multicast group, `91:E0:F0:01:00:00`.
    pub const ADP_ACMP_MULTICAST: Self = Self([0x91, 0xE0, 0xF0, 0x01, 0x00, 0x00]);

    /// `ff:ff:ff:ff:ff:ff`.
    pub const BROADCAST: Self = Self([0xFF; 6]);

    pub const UNSPECIFIED: Self = Self([0; 6]);

    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Group (multicast or broadcast) addresses have the I/G bit set.
    #[must_use]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Error parsing a textual MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address: {0:?}")]
pub struct ParseMacError(String);

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Accepts six hex octets separated by `:` or `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_owned()))?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ParseMacError(s.to_owned()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_owned()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_owned()));
        }
        Ok(Self(octets))
    }
}

/// A 64-bit EUI identifying an ATDECC entity (or controller).
///
/// The all-zero value is the wildcard: "no specific peer on record".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    pub const WILDCARD: Self = Self(0);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Builds an id from its big-endian wire form.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_wildcard(self) -> bool {
        self.0 == 0
    }

    /// `true` if `self` is the wildcard or equals `other` exactly.
    #[must_use]
    pub const fn admits(self, other: Self) -> bool {
        self.is_wildcard() || self.0 == other.0
    }
}

impl From<u64> for EntityId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<EntityId> for u64 {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
