//! Typed identifiers and content references.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::{InvalidNameError, RecordKey};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(RecordKey);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self, InvalidNameError> {
                Ok(Self(RecordKey::new(id)?))
            }

            /// fresh ULID-based id
            pub fn generate() -> Self {
                Self(RecordKey::generate())
            }

            pub fn key(&self) -> &RecordKey {
                &self.0
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<RecordKey> for $name {
            fn from(key: RecordKey) -> Self {
                Self(key)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Key of a repository record.
    RepositoryId
);
record_id!(
    /// Key of a repository version record.
    VersionId
);
record_id!(
    /// Opaque id of a content unit, unique across all content types.
    ContentId
);
record_id!(ArtifactId);
record_id!(
    /// Key of one ledger entry.
    EntryId
);
record_id!(ResourceId);

/// Content type tag such as `file.file` or `rpm.package`.
///
/// Tags are lowercase, dot-separated `<plugin>.<type>` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentType(String);

impl ContentType {
    pub fn new(tag: impl Into<String>) -> Result<Self, InvalidNameError> {
        let tag = tag.into();
        Self::validate(&tag)?;
        Ok(Self(tag))
    }

    fn validate(tag: &str) -> Result<(), InvalidNameError> {
        if tag.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if tag.len() > 64 {
            return Err(InvalidNameError::TooLong(tag.len()));
        }

        for (i, c) in tag.chars().enumerate() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '_' && c != '.' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        let segments: Vec<&str> = tag.split('.').collect();
        if segments.len() != 2 || segments.iter().any(|s| s.is_empty()) {
            return Err(InvalidNameError::InvalidPath(tag.to_string()));
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// the part before the dot
    pub fn plugin(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContentType {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContentType> for String {
    fn from(tag: ContentType) -> Self {
        tag.0
    }
}

impl std::str::FromStr for ContentType {
    type Err = InvalidNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Polymorphic reference to a content unit: type tag plus id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentRef {
    pub content_type: ContentType,
    pub id: ContentId,
}

impl ContentRef {
    pub fn new(content_type: ContentType, id: ContentId) -> Self {
        Self { content_type, id }
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.content_type, self.id)
    }
}

/// Parses the `type:id` form produced by `Display`.
impl std::str::FromStr for ContentRef {
    type Err = InvalidNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (content_type, id) = s
            .split_once(':')
            .ok_or_else(|| InvalidNameError::InvalidPath(s.to_string()))?;
        Ok(Self::new(content_type.parse()?, ContentId::new(id)?))
    }
}

/// Content ids grouped by type.
///
/// Types with no ids are never stored, so two sets compare equal exactly
/// when they hold the same references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentSet(BTreeMap<ContentType, BTreeSet<ContentId>>);

impl ContentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, content: ContentRef) -> bool {
        self.0.entry(content.content_type).or_default().insert(content.id)
    }

    pub fn remove(&mut self, content: &ContentRef) -> bool {
        let Some(ids) = self.0.get_mut(&content.content_type) else {
            return false;
        };
        let removed = ids.remove(&content.id);
        if ids.is_empty() {
            self.0.remove(&content.content_type);
        }
        removed
    }

    pub fn contains(&self, content: &ContentRef) -> bool {
        self.0
            .get(&content.content_type)
            .is_some_and(|ids| ids.contains(&content.id))
    }

    /// ids of one type; empty if the type is absent
    pub fn ids(&self, content_type: &ContentType) -> BTreeSet<ContentId> {
        self.0.get(content_type).cloned().unwrap_or_default()
    }

    pub fn types(&self) -> impl Iterator<Item = &ContentType> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// per-type counts
    pub fn counts(&self) -> BTreeMap<ContentType, usize> {
        self.0.iter().map(|(t, ids)| (t.clone(), ids.len())).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = ContentRef> + '_ {
        self.0.iter().flat_map(|(t, ids)| {
            ids.iter().map(move |id| ContentRef::new(t.clone(), id.clone()))
        })
    }

    /// References in `self` that `other` lacks, computed type by type.
    ///
    /// A type missing on either side counts as an empty set there.
    pub fn difference(&self, other: &ContentSet) -> ContentSet {
        let mut out = ContentSet::new();
        for (content_type, ids) in &self.0 {
            let theirs = other.0.get(content_type);
            for id in ids {
                if !theirs.is_some_and(|t| t.contains(id)) {
                    out.insert(ContentRef::new(content_type.clone(), id.clone()));
                }
            }
        }
        out
    }
}

impl FromIterator<ContentRef> for ContentSet {
    fn from_iter<I: IntoIterator<Item = ContentRef>>(iter: I) -> Self {
        let mut set = ContentSet::new();
        for content in iter {
            set.insert(content);
        }
        set
    }
}

impl Extend<ContentRef> for ContentSet {
    fn extend<I: IntoIterator<Item = ContentRef>>(&mut self, iter: I) {
        for content in iter {
            self.insert(content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cref(t: &str, id: &str) -> ContentRef {
        ContentRef::new(ContentType::new(t).unwrap(), ContentId::new(id).unwrap())
    }

    #[test]
    fn test_content_type_validation() {
        assert!(ContentType::new("file.file").is_ok());
        assert!(ContentType::new("rpm.package_group").is_ok());
        assert!(ContentType::new("").is_err());
        assert!(ContentType::new("file").is_err());
        assert!(ContentType::new("file.").is_err());
        assert!(ContentType::new("a.b.c").is_err());
        assert!(ContentType::new("File.file").is_err());
        assert_eq!(ContentType::new("rpm.package").unwrap().plugin(), "rpm");
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = RepositoryId::new("01hq0000000000000000000000").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"01hq0000000000000000000000\"");
        assert_eq!(serde_json::from_str::<RepositoryId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<ContentId>("\"bad/id\"").is_err());
    }

    #[test]
    fn test_content_set_drops_empty_types() {
        let mut set = ContentSet::new();
        assert!(set.insert(cref("file.file", "a")));
        assert!(!set.insert(cref("file.file", "a")));
        assert!(set.remove(&cref("file.file", "a")));
        assert!(set.is_empty());
        assert_eq!(set, ContentSet::new());
    }

    #[test]
    fn test_difference_per_type() {
        let ours: ContentSet = [cref("file.file", "a"), cref("file.file", "b"), cref("rpm.package", "p")]
            .into_iter()
            .collect();
        let theirs: ContentSet = [cref("file.file", "b"), cref("rpm.advisory", "x")].into_iter().collect();

        let missing = ours.difference(&theirs);
        assert_eq!(missing.len(), 2);
        assert!(missing.contains(&cref("file.file", "a")));
        assert!(missing.contains(&cref("rpm.package", "p")));

        let extra = theirs.difference(&ours);
        assert_eq!(extra.iter().collect::<Vec<_>>(), vec![cref("rpm.advisory", "x")]);
    }

    #[test]
    fn test_content_ref_parses_display_form() {
        let parsed: ContentRef = "file.file:abc".parse().unwrap();
        assert_eq!(parsed, cref("file.file", "abc"));
        assert_eq!(parsed.to_string(), "file.file:abc");
        assert!("abc".parse::<ContentRef>().is_err());
    }

    #[test]
    fn test_counts() {
        let set: ContentSet = [cref("file.file", "a"), cref("file.file", "b"), cref("rpm.package", "p")]
            .into_iter()
            .collect();
        let counts = set.counts();
        assert_eq!(counts[&ContentType::new("file.file").unwrap()], 2);
        assert_eq!(counts[&ContentType::new("rpm.package").unwrap()], 1);
        assert_eq!(set.len(), 3);
    }
}
