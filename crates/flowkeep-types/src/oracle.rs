//! Rate-fix oracle payloads.
//!
//! A `Fix` is an oracle-attested value of a named rate for a given day and
//! tenor. Rates are fixed-point decimals with nine fractional digits so that
//! tolerance comparisons are exact.

use chrono::NaiveDate;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use crate::identity::DigitalSignature;
use crate::session::{PartyId, SessionId};
use crate::transaction::Transaction;

// ---------------------------------------------------------------------------
// Rate
// ---------------------------------------------------------------------------

/// Fractional digits carried by a `Rate`.
pub const RATE_DECIMALS: u32 = 9;
const RATE_SCALE: i64 = 1_000_000_000;

/// Fixed-point decimal rate, stored as an integer count of 1e-9 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Rate(i64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateParseError {
    #[error("empty rate")]
    Empty,
    #[error("invalid rate '{0}'")]
    Invalid(String),
    #[error("rate '{0}' has more than {RATE_DECIMALS} fractional digits")]
    TooPrecise(String),
    #[error("rate '{0}' is out of range")]
    OutOfRange(String),
}

impl Rate {
    pub const ZERO: Rate = Rate(0);

    /// Build a rate from its raw count of 1e-9 units.
    pub const fn from_scaled(units: i64) -> Self {
        Self(units)
    }

    pub const fn scaled(&self) -> i64 {
        self.0
    }

    /// Smallest representable step (1e-9).
    pub const fn epsilon() -> Self {
        Self(1)
    }

    pub fn abs(self) -> Self {
        Self(self.0.saturating_abs())
    }

    /// Absolute difference between two rates.
    pub fn abs_diff(self, other: Rate) -> Rate {
        (self - other).abs()
    }

    fn from_f64(value: f64) -> Option<Self> {
        let scaled = (value * RATE_SCALE as f64).round();
        if scaled.is_finite() && scaled >= i64::MIN as f64 && scaled <= i64::MAX as f64 {
            Some(Self(scaled as i64))
        } else {
            None
        }
    }
}

impl Add for Rate {
    type Output = Rate;

    fn add(self, rhs: Rate) -> Rate {
        Rate(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Rate {
    type Output = Rate;

    fn sub(self, rhs: Rate) -> Rate {
        Rate(self.0.saturating_sub(rhs.0))
    }
}

impl FromStr for Rate {
    type Err = RateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(RateParseError::Empty);
        }

        let (negative, body) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !all_digits(int_part)
            || !all_digits(frac_part)
        {
            return Err(RateParseError::Invalid(s.to_string()));
        }
        if frac_part.len() > RATE_DECIMALS as usize {
            return Err(RateParseError::TooPrecise(s.to_string()));
        }

        let out_of_range = || RateParseError::OutOfRange(s.to_string());
        let int_value: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| out_of_range())?
        };
        let mut frac_value: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| out_of_range())?
        };
        for _ in frac_part.len()..RATE_DECIMALS as usize {
            frac_value *= 10;
        }

        let units = int_value
            .checked_mul(RATE_SCALE)
            .and_then(|v| v.checked_add(frac_value))
            .ok_or_else(out_of_range)?;
        Ok(Rate(if negative { -units } else { units }))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let magnitude = self.0.unsigned_abs();
        let scale = RATE_SCALE as u64;
        if self.0 < 0 {
            f.write_str("-")?;
        }
        let int_part = magnitude / scale;
        let frac_part = magnitude % scale;
        if frac_part == 0 {
            return write!(f, "{int_part}");
        }
        let frac = format!("{frac_part:09}");
        write!(f, "{int_part}.{}", frac.trim_end_matches('0'))
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RateVisitor;

        impl Visitor<'_> for RateVisitor {
            type Value = Rate;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal rate as a string or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Rate, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Rate, E> {
                v.checked_mul(RATE_SCALE)
                    .map(Rate)
                    .ok_or_else(|| E::custom("rate out of range"))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Rate, E> {
                i64::try_from(v)
                    .ok()
                    .and_then(|v| v.checked_mul(RATE_SCALE))
                    .map(Rate)
                    .ok_or_else(|| E::custom("rate out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Rate, E> {
                Rate::from_f64(v).ok_or_else(|| E::custom("rate out of range"))
            }
        }

        deserializer.deserialize_any(RateVisitor)
    }
}

// ---------------------------------------------------------------------------
// Fix payloads
// ---------------------------------------------------------------------------

/// Identifies which rate is being fixed, e.g. `LIBOR 3M` on a given day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixOf {
    pub name: String,
    pub for_day: NaiveDate,
    pub tenor: String,
}

impl FixOf {
    pub fn new(name: impl Into<String>, for_day: NaiveDate, tenor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            for_day,
            tenor: tenor.into(),
        }
    }
}

impl fmt::Display for FixOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.tenor, self.for_day)
    }
}

/// A rate value attested by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fix {
    pub of: FixOf,
    pub value: Rate,
}

/// Request for the current value of a rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixQuery {
    pub fix_of: FixOf,
    pub reply_to: PartyId,
    pub session: SessionId,
}

/// Oracle answer to a `FixQuery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum QueryReply {
    Fix { fix: Fix },
    UnknownFix { fix_of: FixOf },
}

/// Request for the oracle to sign a transaction carrying its fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignRequest {
    pub tx: Transaction,
    pub reply_to: PartyId,
    pub session: SessionId,
}

/// Any request an oracle accepts, tagged so one responder can serve both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum OracleRequest {
    Query(FixQuery),
    Sign(SignRequest),
}

/// Oracle answer to a `SignRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum SignReply {
    Signed { signature: DigitalSignature },
    Refused { reason: String },
}
