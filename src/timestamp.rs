use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version key shared by run directories and committed models.
///
/// Directory names are parsed strictly: only ASCII digits are accepted, so
/// staging directories, editor droppings and the like never parse as a version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("empty timestamp")]
    Empty,
    #[error("invalid timestamp '{0}': expected decimal digits only")]
    InvalidFormat(String),
    #[error("timestamp '{0}' is out of range")]
    OutOfRange(String),
}

impl Timestamp {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Seconds since the Unix epoch, clamped at zero for clocks set before 1970.
    pub fn now() -> Self {
        Self(u64::try_from(Utc::now().timestamp()).unwrap_or(0))
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TimestampError::Empty);
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimestampError::InvalidFormat(s.to_string()));
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| TimestampError::OutOfRange(s.to_string()))
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
