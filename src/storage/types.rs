//! Typed names and ids used by the storage layer.

use std::fmt;

use git2::Oid;
use serde::{Deserialize, Serialize};

macro_rules! oid_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) Oid);

        impl $name {
            pub(crate) fn new(oid: Oid) -> Self {
                Self(oid)
            }

            pub(crate) fn raw(&self) -> Oid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

oid_newtype!(
    /// A commit. Kept distinct from blob and tree ids so they can't be mixed up.
    CommitId
);
oid_newtype!(BlobId);
oid_newtype!(TreeId);

impl CommitId {
    /// abbreviated hex form for log lines
    pub fn short(&self) -> String {
        let mut hex = self.0.to_string();
        hex.truncate(7);
        hex
    }
}

/// Checks shared by table names and record keys: non-empty, at most `max`
/// bytes, only ASCII letters, digits, `_` and `-`.
fn check_identifier(name: &str, max: usize) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }
    if name.len() > max {
        return Err(InvalidNameError::TooLong(name.len()));
    }
    match name
        .char_indices()
        .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
    {
        Some((position, char)) => Err(InvalidNameError::InvalidCharacter { char, position }),
        None => Ok(()),
    }
}

/// Name of a table, i.e. a top-level directory of the store tree.
///
/// An identifier of at most 64 bytes starting with a letter or `_`.
/// Names of internal directories are refused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName(String);

impl TableName {
    const RESERVED: &'static [&'static str] = &["_meta", "_system", "_git"];

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        check_identifier(&name, 64)?;
        if let Some(first) = name.chars().next().filter(|c| !(c.is_ascii_alphabetic() || *c == '_')) {
            return Err(InvalidNameError::InvalidStart(first));
        }
        if Self::RESERVED.contains(&name.to_ascii_lowercase().as_str()) {
            return Err(InvalidNameError::Reserved(name));
        }
        Ok(Self(name))
    }

    /// table names fixed at compile time; their validity is covered by tests
    pub(crate) fn from_static(name: &'static str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a record, used as its file name inside the table directory.
///
/// Generated keys are lowercase ULIDs; content ids chosen by callers go
/// through the same check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Result<Self, InvalidNameError> {
        let key = key.into();
        check_identifier(&key, 128)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordKey {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.0
    }
}

/// A branch. `main` holds published state; each open transaction owns one
/// `tx/{id}` branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchName(String);

impl BranchName {
    pub const MAIN: &'static str = "main";

    pub const TX_PREFIX: &'static str = "tx/";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.contains("..") || name.ends_with('/') || name.starts_with('/') {
            return Err(InvalidNameError::InvalidPath(name));
        }
        Ok(Self(name))
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn for_transaction(tx_id: &str) -> Self {
        Self(format!("{}{}", Self::TX_PREFIX, tx_id))
    }

    /// `Some` only for transaction branches
    pub fn transaction_id(&self) -> Option<&str> {
        self.0.strip_prefix(Self::TX_PREFIX)
    }

    /// e.g. `refs/heads/main`
    pub fn as_ref_path(&self) -> String {
        format!("refs/heads/{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author and committer of store commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    pub fn contentdb() -> Self {
        Self::new("contentdb", "contentdb@localhost")
    }

    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::contentdb()
    }
}

/// A table, key, branch or content type name that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidNameError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name too long: {0} bytes")]
    TooLong(usize),
    #[error("name cannot start with '{0}'")]
    InvalidStart(char),
    #[error("invalid character '{char}' at position {position}")]
    InvalidCharacter { char: char, position: usize },
    #[error("'{0}' is a reserved name")]
    Reserved(String),
    #[error("invalid path: '{0}'")]
    InvalidPath(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        for ok in ["repositories", "repository_content", "_private", "my-table"] {
            assert!(TableName::new(ok).is_ok(), "{ok}");
        }
        assert_eq!(TableName::new(""), Err(InvalidNameError::Empty));
        assert_eq!(TableName::new("123content"), Err(InvalidNameError::InvalidStart('1')));
        assert_eq!(
            TableName::new("content/admin"),
            Err(InvalidNameError::InvalidCharacter { char: '/', position: 7 })
        );
        assert!(matches!(TableName::new("_META"), Err(InvalidNameError::Reserved(_))));
        assert_eq!(TableName::new("a".repeat(65)), Err(InvalidNameError::TooLong(65)));
    }

    #[test]
    fn test_record_keys() {
        assert!(RecordKey::new("abc123").is_ok());
        assert!(RecordKey::new("01ARZ3NDEKTSV4RRFFQ69G5FAV").is_ok());
        assert!(RecordKey::new("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(RecordKey::new("file.rpm").is_err());
        assert!(RecordKey::new("k".repeat(129)).is_err());
    }

    #[test]
    fn test_record_key_generate() {
        let key1 = RecordKey::generate();
        let key2 = RecordKey::generate();
        assert_ne!(key1, key2);
        assert_eq!(key1.as_str().len(), 26); // ULID length
    }

    #[test]
    fn test_record_key_serde_validates() {
        let ok: RecordKey = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(ok.as_str(), "abc");
        assert!(serde_json::from_str::<RecordKey>("\"a/b\"").is_err());
    }

    #[test]
    fn test_branch_names() {
        let tx = BranchName::for_transaction("abc123");
        assert_eq!(tx.transaction_id(), Some("abc123"));
        assert_eq!(tx.as_ref_path(), "refs/heads/tx/abc123");

        assert_eq!(BranchName::main().transaction_id(), None);
        assert!(BranchName::new("tx/../main").is_err());
    }

    #[test]
    fn test_short_commit_id() {
        let id = CommitId::new(Oid::from_str("0123456789abcdef0123456789abcdef01234567").unwrap());
        assert_eq!(id.short(), "0123456");
    }
}
