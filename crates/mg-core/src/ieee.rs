//! IEEE (EUI-64) device address type

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid IEEE addresses
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IeeeError {
    #[error("ieee address must be 16 hex digits (got {0} digits)")]
    InvalidLength(usize),

    #[error("ieee address contains a non-hex character")]
    InvalidChars,

    #[error("ieee address cannot be empty")]
    Empty,
}

/// The 64-bit IEEE address of a mesh device (e.g., "0x00124b0024c2e1a5")
///
/// Addresses are parsed from the common textual forms: with or without a
/// `0x` prefix, with or without `:` byte separators. The canonical display
/// form is `0x` followed by 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ieee(u64);

impl Ieee {
    /// Create an address from its numeric value
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the numeric value of the address
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for Ieee {
    type Err = IeeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IeeeError::Empty);
        }

        let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        let digits: String = s.chars().filter(|c| *c != ':').collect();

        if digits.len() != 16 {
            return Err(IeeeError::InvalidLength(digits.len()));
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IeeeError::InvalidChars);
        }

        // Length and digit checks above make this parse infallible
        let addr = u64::from_str_radix(&digits, 16).map_err(|_| IeeeError::InvalidChars)?;
        Ok(Self(addr))
    }
}

impl TryFrom<String> for Ieee {
    type Error = IeeeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ieee> for String {
    fn from(ieee: Ieee) -> String {
        ieee.to_string()
    }
}

impl fmt::Display for Ieee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}
