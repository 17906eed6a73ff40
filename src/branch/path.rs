//! Slash-separated branch paths rooted at `MAIN`.
//!
//! Ancestry is purely lexical: `MAIN/a/b` has parent `MAIN/a` and root `MAIN`,
//! so chains can be computed without touching the index.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::storage::{DocKey, InvalidNameError};

/// Name of the root branch.
pub const MAIN: &str = "MAIN";

const SEPARATOR: char = '/';
const KEY_SEPARATOR: char = '+';
const MAX_SEGMENT_LEN: usize = 50;

/// A validated branch path such as `MAIN/project/task-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchPath(String);

impl BranchPath {
    pub fn new(path: impl Into<String>) -> Result<Self, InvalidNameError> {
        let path = path.into();
        Self::validate(&path)?;
        Ok(Self(path))
    }

    fn validate(path: &str) -> Result<(), InvalidNameError> {
        if path.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        let mut segments = path.split(SEPARATOR);
        if segments.next() != Some(MAIN) {
            return Err(InvalidNameError::InvalidPath(path.to_string()));
        }

        for segment in segments {
            Self::validate_segment(segment).map_err(|_| InvalidNameError::InvalidPath(path.to_string()))?;
        }

        Ok(())
    }

    /// Validate a single child name.
    pub fn validate_segment(name: &str) -> Result<(), InvalidNameError> {
        let Some(first) = name.chars().next() else {
            return Err(InvalidNameError::Empty);
        };
        if name.len() > MAX_SEGMENT_LEN {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if first == '.' {
            return Err(InvalidNameError::InvalidStart(first));
        }
        for (i, c) in name.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && !matches!(c, '_' | '-' | '.') {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }
        Ok(())
    }

    pub fn main() -> Self {
        Self(MAIN.to_string())
    }

    pub fn is_main(&self) -> bool {
        self.0 == MAIN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment (`task-1` for `MAIN/project/task-1`).
    pub fn name(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or(MAIN)
    }

    /// Number of segments below `MAIN`.
    pub fn depth(&self) -> usize {
        self.0.matches(SEPARATOR).count()
    }

    pub fn parent(&self) -> Option<BranchPath> {
        self.0
            .rsplit_once(SEPARATOR)
            .map(|(parent, _)| BranchPath(parent.to_string()))
    }

    pub fn child(&self, name: &str) -> Result<BranchPath, InvalidNameError> {
        Self::validate_segment(name)?;
        Ok(BranchPath(format!("{}{}{}", self.0, SEPARATOR, name)))
    }

    /// This path followed by every ancestor up to `MAIN`.
    pub fn chain(&self) -> Vec<BranchPath> {
        let mut chain = vec![self.clone()];
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            chain.push(path);
        }
        chain
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &BranchPath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0[self.0.len()..].starts_with(SEPARATOR)
    }

    /// Deepest path that is an ancestor of (or equal to) both paths.
    pub fn common_ancestor(&self, other: &BranchPath) -> BranchPath {
        let mut common = Vec::new();
        for (a, b) in self.0.split(SEPARATOR).zip(other.0.split(SEPARATOR)) {
            if a != b {
                break;
            }
            common.push(a);
        }
        if common.is_empty() {
            return BranchPath::main();
        }
        BranchPath(common.join("/"))
    }

    /// Prefix shared by every descendant's path.
    pub fn descendant_prefix(&self) -> String {
        format!("{}{}", self.0, SEPARATOR)
    }

    /// Encoding of the path usable inside document keys.
    pub fn key_segment(&self) -> String {
        self.0.replace(SEPARATOR, &KEY_SEPARATOR.to_string())
    }

    pub fn doc_key(&self) -> Result<DocKey, InvalidNameError> {
        DocKey::new(self.key_segment())
    }
}

impl fmt::Display for BranchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BranchPath {
    type Err = InvalidNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BranchPath {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BranchPath> for String {
    fn from(path: BranchPath) -> Self {
        path.0
    }
}

impl AsRef<str> for BranchPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
