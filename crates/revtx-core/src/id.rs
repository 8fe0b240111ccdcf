//! Strongly-typed identifiers for revtx entities.
//!
//! All identifiers are strongly typed to prevent mixing up different ID
//! types at compile time. Change, patch-set, and account IDs are small
//! numerics, matching the review server's stable entity numbering; project
//! names are validated strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The name of a repository ("project") holding reviewable changes.
///
/// Project names are validated at construction so that they can be used
/// directly in storage paths and log output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    /// Creates a validated project name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, contains path separators,
    /// control characters, or leading/trailing whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidId {
                message: "project name cannot be empty".into(),
            });
        }
        if name.contains('\\') || name.starts_with('/') || name.ends_with('/') {
            return Err(Error::InvalidId {
                message: format!("project name has invalid path shape: {name}"),
            });
        }
        if name.chars().any(char::is_control) {
            return Err(Error::InvalidId {
                message: "project name cannot contain control characters".into(),
            });
        }
        if name != name.trim() {
            return Err(Error::InvalidId {
                message: format!("project name has surrounding whitespace: {name:?}"),
            });
        }
        Ok(Self(name))
    }

    /// Returns the project name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// A unique identifier for a change, the reviewable unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChangeId(u32);

impl ChangeId {
    /// Creates a change ID from its stable number.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the stable change number.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u32>().map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid change ID '{s}': {e}"),
        })
    }
}

/// Identifies one revision (patch set) of a change's content.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct PatchSetId {
    /// The change this patch set belongs to.
    pub change: ChangeId,
    /// One-based patch set number within the change.
    pub number: u32,
}

impl PatchSetId {
    /// Creates a patch set ID.
    #[must_use]
    pub const fn new(change: ChangeId, number: u32) -> Self {
        Self { change, number }
    }
}

impl fmt::Display for PatchSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.change, self.number)
    }
}

/// A unique identifier for a user account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AccountId(u32);

impl AccountId {
    /// Creates an account ID from its stable number.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the stable account number.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The principal performing an update.
///
/// Updates run either on behalf of an identified account or as the server
/// itself (for example during background maintenance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Principal {
    /// The server's own identity.
    Server,
    /// An identified user account.
    Account(AccountId),
}

impl Principal {
    /// Returns the account ID if this principal is an identified user.
    #[must_use]
    pub fn account(&self) -> Option<AccountId> {
        match self {
            Self::Server => None,
            Self::Account(id) => Some(*id),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Account(id) => write!(f, "account/{id}"),
        }
    }
}
