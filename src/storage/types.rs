//! core type-safe wrappers for the document index.

use std::fmt;

use git2::Oid;
use serde::{Deserialize, Serialize};

/// A git commit identifier for the git-backed index.
///
/// This makes sure we don't accidentally pass a blob ID where a commit ID
/// is expected. The inner Oid is only accessible within the storage module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git blob identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub(crate) Oid);

impl BlobId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

/// Git tree identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub(crate) Oid);

impl TreeId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

/// A validated collection name.
///
/// Collections map to directories in the git-backed index, so names are
/// restricted to prevent path traversal.
///
/// Valid names:
/// - 1-64 characters
/// - Alphanumeric, underscores, hyphens only
/// - Must start with a letter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionName(String);

impl CollectionName {
    /// create a new CollectionName, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        let Some(first_char) = name.chars().next() else {
            return Err(InvalidNameError::Empty);
        };

        if name.len() > 64 {
            return Err(InvalidNameError::TooLong(name.len()));
        }

        if !first_char.is_ascii_alphabetic() {
            return Err(InvalidNameError::InvalidStart(first_char));
        }

        for (i, c) in name.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    /// collection holding branch documents
    pub fn branches() -> Self {
        Self("branches".to_string())
    }

    /// collection holding revision documents
    pub fn revisions() -> Self {
        Self("revisions".to_string())
    }

    /// collection holding commit records
    pub fn commits() -> Self {
        Self("commits".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CollectionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated document key.
///
/// Keys are used as filenames by the git-backed index, so only a small
/// character set is accepted. Composite keys join their parts with `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey(String);

impl DocKey {
    const EXTRA_CHARS: &'static [char] = &['_', '-', '.', '@', '+'];

    pub fn new(key: impl Into<String>) -> Result<Self, InvalidNameError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    fn validate(key: &str) -> Result<(), InvalidNameError> {
        if key.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        if key.len() > 255 {
            return Err(InvalidNameError::TooLong(key.len()));
        }

        if key.starts_with('.') {
            return Err(InvalidNameError::InvalidStart('.'));
        }

        for (i, c) in key.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && !Self::EXTRA_CHARS.contains(&c) {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    /// Generate a new ULID-based key.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DocKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// git signature (author/committer info)
#[derive(Debug, Clone)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    /// default signature for index writes
    pub fn revdb() -> Self {
        Self {
            name: "revdb".to_string(),
            email: "revdb@localhost".to_string(),
        }
    }

    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

/// error type for invalid names (collections, keys, branch paths)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
    InvalidPath(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
        }
    }
}

impl std::error::Error for InvalidNameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_valid() {
        assert!(CollectionName::new("revisions").is_ok());
        assert!(CollectionName::new("commit_log").is_ok());
        assert!(CollectionName::new("Branches2").is_ok());
    }

    #[test]
    fn test_collection_name_invalid() {
        assert!(CollectionName::new("").is_err());
        assert!(CollectionName::new("1revisions").is_err());
        assert!(CollectionName::new("_meta").is_err());
        assert!(CollectionName::new("a/b").is_err());
        assert!(CollectionName::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_doc_key_accepts_composite_keys() {
        assert!(DocKey::new("concept@138875005@MAIN+task1@00000000000000000042").is_ok());
        assert!(DocKey::new("01ARZ3NDEKTSV4RRFFQ69G5FAV").is_ok());
        assert!(DocKey::new("MAIN").is_ok());
    }

    #[test]
    fn test_doc_key_rejects_path_characters() {
        assert!(DocKey::new("").is_err());
        assert!(DocKey::new("MAIN/task1").is_err());
        assert!(DocKey::new("..").is_err());
        assert!(matches!(
            DocKey::new("a b"),
            Err(InvalidNameError::InvalidCharacter { char: ' ', position: 1 })
        ));
    }

    #[test]
    fn test_doc_key_generate() {
        let key1 = DocKey::generate();
        let key2 = DocKey::generate();
        assert_ne!(key1, key2);
        assert_eq!(key1.as_str().len(), 26);
    }
}
