//! Endpoint address validation.
//!
//! An [`Address`] identifies a registerable endpoint on the Exchange. The
//! wire format is `local@domain`, where `local` is non-empty and `domain`
//! is non-empty and contains at least one `.`. Validation happens once, at
//! construction, so every other component can treat an `Address` as already
//! well-formed.

use std::fmt;

use crate::error::{EngineError, Result};

/// A validated `local@domain` endpoint identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Validate and wrap a raw address string.
    ///
    /// Returns [`EngineError::InvalidAddress`] if `raw` is not of the form
    /// `local@domain` with a non-empty `local`, a non-empty `domain`, and at
    /// least one `.` in `domain`.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let (local, domain) = raw
            .split_once('@')
            .ok_or_else(|| EngineError::InvalidAddress(raw.clone()))?;

        if local.is_empty() || domain.is_empty() || !domain.contains('.') {
            return Err(EngineError::InvalidAddress(raw));
        }

        Ok(Self(raw))
    }

    /// The full `local@domain` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The portion before `@`.
    pub fn local(&self) -> &str {
        self.0.split_once('@').map(|(l, _)| l).unwrap_or(&self.0)
    }

    /// The portion after `@`.
    pub fn domain(&self) -> &str {
        self.0.split_once('@').map(|(_, d)| d).unwrap_or("")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Address::parse(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}
