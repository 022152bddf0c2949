//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of an account (multi-tenant boundary).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(i64);

/// Identifier of an engineering datasheet within an account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SheetId(i64);

macro_rules! impl_int_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(value))
            }
        }
    };
}

impl_int_newtype!(AccountId, "AccountId");
impl_int_newtype!(SheetId, "SheetId");

/// Natural key shared by the snapshot row and the rebuild queue entry.
///
/// Identifies one sheet's instrument-link view within one account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub account_id: AccountId,
    pub sheet_id: SheetId,
}

impl SnapshotKey {
    pub fn new(account_id: impl Into<AccountId>, sheet_id: impl Into<SheetId>) -> Self {
        Self {
            account_id: account_id.into(),
            sheet_id: sheet_id.into(),
        }
    }
}

impl core::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.account_id, self.sheet_id)
    }
}

/// Parses the `account/sheet` form produced by `Display`.
impl FromStr for SnapshotKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (account, sheet) = s
            .split_once('/')
            .ok_or_else(|| DomainError::invalid_id(format!("SnapshotKey: expected account/sheet, got '{s}'")))?;
        Ok(Self {
            account_id: account.parse()?,
            sheet_id: sheet.parse()?,
        })
    }
}

/// Identity of a queue worker, recorded as `claimed_by` on claimed entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique identity (`<pid>-<uuid v7>`).
    pub fn generate() -> Self {
        Self(format!("{}-{}", std::process::id(), Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_key_display_round_trips() {
        let key = SnapshotKey::new(1, 5);
        assert_eq!(key.to_string(), "1/5");
        assert_eq!("1/5".parse::<SnapshotKey>().unwrap(), key);
    }

    #[test]
    fn snapshot_key_rejects_malformed_input() {
        assert!(matches!(
            "15".parse::<SnapshotKey>(),
            Err(DomainError::InvalidId(_))
        ));
        assert!(matches!(
            "1/abc".parse::<SnapshotKey>(),
            Err(DomainError::InvalidId(_))
        ));
    }

    #[test]
    fn generated_worker_ids_are_unique() {
        let a = WorkerId::generate();
        let b = WorkerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(&std::process::id().to_string()));
    }
}
