use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const MICROS_PER_USD: i64 = 1_000_000;

/// Fixed-point US dollar amount in millionths of a dollar.
///
/// Every ledger amount goes through this type so that repeated sub-cent
/// charges never accumulate floating point error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsdMicros(i64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("invalid amount: {0:?}")]
    Invalid(String),
    #[error("amount has more than 6 fractional digits: {0:?}")]
    TooPrecise(String),
    #[error("amount out of range: {0:?}")]
    Overflow(String),
}

impl UsdMicros {
    pub const ZERO: Self = Self(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn checked_mul(self, factor: i64) -> Option<Self> {
        self.0.checked_mul(factor).map(Self)
    }

    pub fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

impl FromStr for UsdMicros {
    type Err = MoneyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let unsigned = trimmed.strip_prefix('$').unwrap_or(trimmed);
        let (negative, digits) = match unsigned.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, unsigned),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(MoneyError::Invalid(raw.to_string()));
        }
        if !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(MoneyError::Invalid(raw.to_string()));
        }
        if fraction.len() > 6 {
            return Err(MoneyError::TooPrecise(raw.to_string()));
        }

        let whole_value: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| MoneyError::Overflow(raw.to_string()))?
        };
        let mut fraction_value: i64 = 0;
        for (idx, byte) in fraction.bytes().enumerate() {
            let digit = i64::from(byte - b'0');
            fraction_value += digit * 10_i64.pow(5 - idx as u32);
        }

        let micros = whole_value
            .checked_mul(MICROS_PER_USD)
            .and_then(|value| value.checked_add(fraction_value))
            .ok_or_else(|| MoneyError::Overflow(raw.to_string()))?;
        Ok(Self(if negative { -micros } else { micros }))
    }
}

impl fmt::Display for UsdMicros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / MICROS_PER_USD as u64;
        let fraction = abs % MICROS_PER_USD as u64;
        if fraction == 0 {
            return write!(f, "{sign}{whole}.00");
        }
        let fraction = format!("{fraction:06}");
        let trimmed = fraction.trim_end_matches('0');
        let shown = if trimmed.len() < 2 {
            &fraction[..2]
        } else {
            trimmed
        };
        write!(f, "{sign}{whole}.{shown}")
    }
}

// Amounts cross the wire as decimal strings so clients never see binary floats.
impl Serialize for UsdMicros {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Accepts decimal strings and plain JSON/TOML numbers, both in dollars.
/// Numbers go through their shortest decimal form, so `0.005` stays exact.
impl<'de> Deserialize<'de> for UsdMicros {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Dollars(i64),
            Fractional(f64),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.parse(),
            Raw::Dollars(dollars) => dollars
                .checked_mul(MICROS_PER_USD)
                .map(Self)
                .ok_or_else(|| MoneyError::Overflow(dollars.to_string())),
            Raw::Fractional(value) if value.is_finite() => format!("{value}").parse(),
            Raw::Fractional(value) => Err(MoneyError::Invalid(value.to_string())),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}
