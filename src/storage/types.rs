//! core type-safe wrappers for the storage layer.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Identifies exactly one record.
///
/// Locators are assigned by the primary-key service; the storage layer only
/// compares and encodes them (8 bytes, big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Locator(u64);

impl Locator {
    /// width of the encoded form in bytes
    pub const WIDTH: usize = 8;

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// raw numeric form
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Locator {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A validated field name.
///
/// Valid names:
/// - 1-255 bytes of UTF-8
/// - no whitespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldName(String);

impl FieldName {
    /// longest accepted name, in bytes
    pub const MAX_LEN: usize = 255;

    /// create a new FieldName, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::check(&name)?;
        Ok(Self(name))
    }

    fn check(name: &str) -> Result<(), InvalidNameError> {
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        if name.len() > Self::MAX_LEN {
            return Err(InvalidNameError::TooLong(name.len()));
        }

        for (i, c) in name.chars().enumerate() {
            if c.is_whitespace() {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for FieldName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FieldName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for FieldName {
    type Error = InvalidNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FieldName> for String {
    fn from(name: FieldName) -> Self {
        name.0
    }
}

/// A point in time, in microseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// the earliest representable instant
    pub const EPOCH: Timestamp = Timestamp(0);
    /// the latest representable instant; reads at `MAX` see the present state
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// current wall-clock time
    pub fn now() -> Self {
        let micros = Utc::now().timestamp_micros();
        Self(u64::try_from(micros).unwrap_or(0))
    }

    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// convert to a calendar time, if representable
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let micros = i64::try_from(self.0).ok()?;
        Utc.timestamp_micros(micros).single()
    }
}

impl From<u64> for Timestamp {
    fn from(micros: u64) -> Self {
        Self(micros)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// what a revision did to its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Add,
    Remove,
}

impl Action {
    /// tag byte used by the binary encoding
    pub const fn tag(&self) -> u8 {
        match self {
            Action::Add => 1,
            Action::Remove => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Action::Add),
            2 => Some(Action::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add => write!(f, "ADD"),
            Action::Remove => write!(f, "REMOVE"),
        }
    }
}

/// error type for invalid field names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidCharacter { char: char, position: usize },
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} bytes", len),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character {:?} at position {}", char, position)
            }
        }
    }
}

impl std::error::Error for InvalidNameError {}
