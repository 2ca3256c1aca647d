//! Human readable byte sizes, such as `10G` or `2.5K`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

const UNITS: [(char, u64); 4] = [
    ('T', 1 << 40),
    ('G', 1 << 30),
    ('M', 1 << 20),
    ('K', 1 << 10),
];

/// A size in bytes which is parsed from and displayed with binary unit suffixes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size(u64);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid size `{0}`, expected a number with an optional K, M, G or T suffix")]
pub struct InvalidSize(String);

impl Size {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl From<u64> for Size {
    fn from(bytes: u64) -> Self {
        Self(bytes)
    }
}

impl FromStr for Size {
    type Err = InvalidSize;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || InvalidSize(s.to_owned());

        let (number, multiplier) = match trimmed.chars().last() {
            Some(last) if last.is_ascii_alphabetic() => {
                let unit = last.to_ascii_uppercase();
                let (_, multiplier) = UNITS
                    .iter()
                    .find(|(symbol, _)| *symbol == unit)
                    .ok_or_else(invalid)?;
                (&trimmed[..trimmed.len() - 1], *multiplier)
            }
            Some(_) => (trimmed, 1),
            None => return Err(invalid()),
        };

        if let Ok(bytes) = number.parse::<u64>() {
            return bytes.checked_mul(multiplier).map(Size).ok_or_else(invalid);
        }

        let value: f64 = number.parse().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }
        Ok(Size((value * multiplier as f64).round() as u64))
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (symbol, multiplier) in UNITS {
            if self.0 >= multiplier {
                let value = format!("{:.2}", self.0 as f64 / multiplier as f64);
                let value = value.trim_end_matches('0').trim_end_matches('.');
                return write!(f, "{value}{symbol}");
            }
        }
        write!(f, "{}", self.0)
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug)]
struct SizeVisitor;

impl de::Visitor<'_> for SizeVisitor {
    type Value = Size;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a byte count or a string like \"10G\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Size(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(Size)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SizeVisitor)
    }
}
