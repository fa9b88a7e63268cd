//! Strongly-typed identifiers used across the pipeline.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Ledger-assigned token identifier in `1..=TokenId::MAX`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct TokenId(u64);

impl TokenId {
    /// Largest identifier a `BIGINT` column holds.
    pub const MAX: u64 = i64::MAX as u64;

    pub fn new(value: u64) -> Result<Self, DomainError> {
        if value == 0 {
            return Err(DomainError::invalid_id("TokenId: identifiers start at 1"));
        }
        if value > Self::MAX {
            return Err(DomainError::invalid_id(format!(
                "TokenId: {value} exceeds {}",
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Postgres stores identifiers as `BIGINT`; `new` keeps the value in range.
    pub fn as_i64(&self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }
}

impl core::fmt::Display for TokenId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<u64> for TokenId {
    type Error = DomainError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<i64> for TokenId {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let value = u64::try_from(value)
            .map_err(|_| DomainError::invalid_id(format!("TokenId: negative value {value}")))?;
        Self::new(value)
    }
}

impl From<TokenId> for u64 {
    fn from(value: TokenId) -> Self {
        value.0
    }
}

impl FromStr for TokenId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u64>()
            .map_err(|e| DomainError::invalid_id(format!("TokenId: {e}")))?;
        Self::new(value)
    }
}

/// Attribution owner of a token: a 20-byte account address.
///
/// Always held in canonical form (`0x` prefix, lowercase hex) so that the same
/// account never produces two owner records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerRef(String);

impl OwnerRef {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let raw = raw.trim();
        let hex = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .ok_or_else(|| DomainError::invalid_id(format!("OwnerRef: missing 0x prefix: {raw}")))?;

        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::invalid_id(format!(
                "OwnerRef: expected 40 hex digits: {raw}"
            )));
        }

        Ok(Self(format!("0x{}", hex.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OwnerRef {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OwnerRef {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OwnerRef> for String {
    fn from(value: OwnerRef) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_id_rejects_zero_and_negative() {
        assert!(TokenId::new(0).is_err());
        assert!(TokenId::try_from(-4i64).is_err());
        assert_eq!(TokenId::new(7).unwrap().get(), 7);
        assert_eq!("42".parse::<TokenId>().unwrap().as_i64(), 42);
    }

    #[test]
    fn token_id_fits_a_bigint() {
        let max = TokenId::new(TokenId::MAX).unwrap();
        assert_eq!(max.as_i64(), i64::MAX);
        assert!(TokenId::new(TokenId::MAX + 1).is_err());
        assert!(TokenId::new(u64::MAX).is_err());
        assert!("18446744073709551615".parse::<TokenId>().is_err());
        assert!(serde_json::from_str::<TokenId>("18446744073709551615").is_err());
    }

    #[test]
    fn owner_ref_is_canonicalized() {
        let owner = OwnerRef::parse("0xAbCdEf0123456789aBcDeF0123456789ABCDEF01").unwrap();
        assert_eq!(owner.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");

        let same: OwnerRef = "0xabcdef0123456789abcdef0123456789abcdef01".parse().unwrap();
        assert_eq!(owner, same);
    }

    #[test]
    fn owner_ref_rejects_malformed_addresses() {
        assert!(OwnerRef::parse("abcdef0123456789abcdef0123456789abcdef01").is_err());
        assert!(OwnerRef::parse("0x1234").is_err());
        assert!(OwnerRef::parse("0xzzcdef0123456789abcdef0123456789abcdef01").is_err());
    }

    #[test]
    fn serde_goes_through_validation() {
        let id: TokenId = serde_json::from_str("9").unwrap();
        assert_eq!(id.get(), 9);
        assert!(serde_json::from_str::<TokenId>("0").is_err());
        assert!(serde_json::from_str::<OwnerRef>("\"0x12\"").is_err());
    }
}
