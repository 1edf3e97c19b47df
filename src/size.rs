//! LVM-style size quantities.
//!
//! Sizes are constructed from suffixed strings as accepted by commands like
//! lvcreate(8): a number followed by an optional unit suffix, one of B
//! (bytes), S (512-byte sectors), or K/M/G/T/P/E. Suffixes are not
//! case-sensitive and the default unit is megabytes. Negative sizes are
//! rejected. Unlike some LVM commands, an upper-case suffix is not read as a
//! power of ten.

use crate::error::{self, Error};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const SECTOR: u64 = 512;

// Smallest-to-largest is the reverse of the display scan order below.
const SUFFIXES: [(char, u64); 8] = [
    ('b', 1),
    ('s', SECTOR),
    ('k', 1 << 10),
    ('m', 1 << 20),
    ('g', 1 << 30),
    ('t', 1 << 40),
    ('p', 1 << 50),
    ('e', 1 << 60),
];

fn multiplier(suffix: char) -> Option<u64> {
    SUFFIXES
        .iter()
        .find(|(c, _)| *c == suffix)
        .map(|(_, m)| *m)
}

/// A byte count convertible to and from LVM-style suffixed strings.
///
/// The string form produced by `Display` always parses back to the same
/// value, which is what lets sizes round-trip through the configuration
/// file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size {
    bytes: u64,
}

impl Size {
    pub fn from_bytes(bytes: u64) -> Self {
        Self { bytes }
    }

    pub fn to_bytes(self) -> u64 {
        self.bytes
    }

    /// This size as a count of 512-byte sectors, rounding up.
    pub fn to_sectors(self) -> u64 {
        self.bytes.div_ceil(SECTOR)
    }

    /// Rounds this size down to a multiple of the given block size.
    pub fn round_down(&mut self, block_size: u64) {
        self.bytes = (self.bytes / block_size) * block_size;
    }

    pub fn is_zero(self) -> bool {
        self.bytes == 0
    }
}

impl FromStr for Size {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Size::default());
        }
        let invalid = || error::InvalidSizeSnafu { size: s }.build();

        let (number, mult) = match s.chars().last() {
            Some(c) if c.is_ascii_alphabetic() => {
                let mult = multiplier(c.to_ascii_lowercase()).ok_or_else(invalid)?;
                (&s[..s.len() - 1], mult)
            }
            // Default unit is megabytes.
            _ => (s, 1 << 20),
        };
        let value: f64 = number.parse().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }
        Ok(Size {
            bytes: (value * mult as f64) as u64,
        })
    }
}

impl fmt::Display for Size {
    /// Writes the size as a suffixed string without a decimal point, using
    /// the largest suffix that divides it exactly.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bytes == 0 {
            return write!(f, "0");
        }
        for (suffix, mult) in SUFFIXES.iter().rev() {
            if *mult > 1 && self.bytes % mult == 0 && *suffix != 's' {
                return write!(f, "{}{}", self.bytes / mult, suffix.to_ascii_uppercase());
            }
        }
        write!(f, "{}B", self.bytes)
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
