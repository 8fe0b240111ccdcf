//! Ref names, object IDs, and the compare-and-swap command vocabulary.
//!
//! A ref is a named, atomically-updatable pointer to version-controlled
//! content; it is the storage system's compare-and-swap unit. Every mutation
//! performed by the update engine ultimately resolves to a batch of
//! [`RefCommand`]s executed against one repository.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::id::{AccountId, ChangeId, PatchSetId};

/// Length of an object ID in bytes.
pub const OBJECT_ID_LEN: usize = 20;

/// A content address for an object in repository storage.
///
/// Rendered as 40 hex characters. The all-zero ID is a sentinel used in
/// ref commands to mean "no value" (ref creation or deletion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Creates an object ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the all-zero sentinel ID.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0; OBJECT_ID_LEN])
    }

    /// Returns whether this is the all-zero sentinel.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; OBJECT_ID_LEN]
    }

    /// Computes the content address of a byte payload.
    #[must_use]
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0; OBJECT_ID_LEN];
        bytes.copy_from_slice(&digest[..OBJECT_ID_LEN]);
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// Parses an object ID from 40 hex characters.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not exactly 40 hex characters.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != OBJECT_ID_LEN * 2 {
            return Err(Error::InvalidId {
                message: format!("object ID must be {} hex chars: {hex}", OBJECT_ID_LEN * 2),
            });
        }
        let mut bytes = [0; OBJECT_ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &hex[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|e| Error::InvalidId {
                message: format!("invalid hex in object ID '{hex}': {e}"),
            })?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(D::Error::custom)
    }
}

/// Namespace prefix for per-change metadata refs.
pub const CHANGES_PREFIX: &str = "refs/changes/";

/// Namespace prefix for per-user draft-comment refs.
///
/// Draft fields are not stored in the change index, so a batch touching
/// only this namespace does not trigger reindexing.
pub const DRAFT_COMMENTS_PREFIX: &str = "refs/draft-comments/";

/// A validated ref name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefName(String);

impl RefName {
    /// Creates a validated ref name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, does not live under `refs/`,
    /// or contains segments that ref storage rejects (`..`, empty segments,
    /// whitespace, control characters).
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !name.starts_with("refs/") || name.ends_with('/') {
            return Err(Error::InvalidRef {
                message: format!("ref name must be refs/<...>: {name}"),
            });
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::InvalidRef {
                message: format!("ref name cannot contain whitespace: {name:?}"),
            });
        }
        for segment in name.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(Error::InvalidRef {
                    message: format!("ref name has invalid segment: {name}"),
                });
            }
        }
        Ok(Self(name))
    }

    /// Returns the ref that holds a change's metadata log.
    ///
    /// Change refs are sharded by the last two digits of the change number
    /// to keep directory fan-out bounded.
    #[must_use]
    pub fn change_meta(change: ChangeId) -> Self {
        Self(format!(
            "{CHANGES_PREFIX}{:02}/{}/meta",
            change.get() % 100,
            change
        ))
    }

    /// Returns the ref that points at one patch set's content.
    #[must_use]
    pub fn patch_set(ps: PatchSetId) -> Self {
        Self(format!(
            "{CHANGES_PREFIX}{:02}/{}/{}",
            ps.change.get() % 100,
            ps.change,
            ps.number
        ))
    }

    /// Returns the ref that holds one user's draft comments on a change.
    #[must_use]
    pub fn draft_comments(change: ChangeId, account: AccountId) -> Self {
        Self(format!("{DRAFT_COMMENTS_PREFIX}{change}/{account}"))
    }

    /// Returns whether this ref lives in the draft-comments namespace.
    #[must_use]
    pub fn is_draft_comments(&self) -> bool {
        self.0.starts_with(DRAFT_COMMENTS_PREFIX)
    }

    /// Returns the ref name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RefName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// One compare-and-swap ref update.
///
/// `old = None` means the ref must not exist; `new = None` means the ref is
/// deleted. At least one side must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefCommand {
    /// The ref being updated.
    pub name: RefName,
    /// Expected current value, or `None` if the ref must not exist.
    pub old: Option<ObjectId>,
    /// New value, or `None` to delete the ref.
    pub new: Option<ObjectId>,
}

impl RefCommand {
    /// Creates a command that creates a ref which must not yet exist.
    #[must_use]
    pub fn create(name: RefName, new: ObjectId) -> Self {
        Self {
            name,
            old: None,
            new: Some(new),
        }
    }

    /// Creates a command that moves an existing ref from `old` to `new`.
    #[must_use]
    pub fn update(name: RefName, old: ObjectId, new: ObjectId) -> Self {
        Self {
            name,
            old: Some(old),
            new: Some(new),
        }
    }

    /// Creates a command that deletes a ref currently at `old`.
    #[must_use]
    pub fn delete(name: RefName, old: ObjectId) -> Self {
        Self {
            name,
            old: Some(old),
            new: None,
        }
    }

    /// Returns whether this command deletes its ref.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.new.is_none()
    }
}

/// The per-command outcome of an executed ref batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// The command was applied.
    Ok,
    /// A concurrent writer won the compare-and-swap race for this ref.
    LockFailure,
    /// A sibling command's lock failure aborted the whole transaction;
    /// this command itself was fine.
    TransactionAborted,
    /// The command was rejected for a non-contention reason.
    Rejected(String),
    /// Storage I/O failed while applying the command.
    IoError(String),
    /// The command was never attempted (a prior command failed on a
    /// backend without atomic batches).
    NotAttempted,
}

impl CommandResult {
    /// Returns whether the command was applied.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns whether this failure is pure lock contention: either the
    /// command itself lost the compare-and-swap race, or it was aborted by
    /// a sibling that did.
    #[must_use]
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockFailure | Self::TransactionAborted)
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::LockFailure => write!(f, "LOCK_FAILURE"),
            Self::TransactionAborted => write!(f, "TRANSACTION_ABORTED"),
            Self::Rejected(reason) => write!(f, "REJECTED({reason})"),
            Self::IoError(reason) => write!(f, "IO_ERROR({reason})"),
            Self::NotAttempted => write!(f, "NOT_ATTEMPTED"),
        }
    }
}

/// The ordered, deduplicated accumulation of ref commands staged by one
/// update.
///
/// Staging a second command for a ref chains it onto the first: the
/// second command's expected old value must equal the first command's new
/// value, and the two collapse into one command covering both steps.
/// Conflicting expectations for the same ref are rejected.
#[derive(Debug, Default)]
pub struct PendingRefUpdates {
    commands: Vec<RefCommand>,
    by_name: HashMap<RefName, usize>,
}

impl PendingRefUpdates {
    /// Creates an empty pending set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a command, chaining it onto any previous command for the
    /// same ref.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RefConflict`] if the command's expected old value
    /// does not continue from the previously staged new value for the ref.
    pub fn add(&mut self, cmd: RefCommand) -> Result<()> {
        if let Some(&idx) = self.by_name.get(&cmd.name) {
            let staged = &mut self.commands[idx];
            if staged.new != cmd.old {
                return Err(Error::RefConflict {
                    message: format!(
                        "ref {} already staged with new value {:?}, cannot chain command expecting {:?}",
                        cmd.name, staged.new, cmd.old
                    ),
                });
            }
            staged.new = cmd.new;
            return Ok(());
        }
        self.by_name.insert(cmd.name.clone(), self.commands.len());
        self.commands.push(cmd);
        Ok(())
    }

    /// Returns the staged commands in insertion order.
    #[must_use]
    pub fn commands(&self) -> &[RefCommand] {
        &self.commands
    }

    /// Returns the staged command for a ref, if any.
    #[must_use]
    pub fn get(&self, name: &RefName) -> Option<&RefCommand> {
        self.by_name.get(name).map(|&idx| &self.commands[idx])
    }

    /// Returns whether no commands are staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Returns the number of staged commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }
}
