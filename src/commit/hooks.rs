//! Synchronous pre-commit validation.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::branch::Branch;
use crate::commit::changeset::ChangeSet;
use crate::error::StoreResult;
use crate::revision::{ReadChain, RevisionStore};

/// What a hook sees: the target branch and a read view at its current head.
pub struct HookContext<'a> {
    pub branch: &'a Branch,
    pub chain: &'a ReadChain,
    pub revisions: &'a RevisionStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Accept,
    Reject(String),
}

/// Invoked by the commit coordinator with the staged change set before any
/// revision is written.
pub trait CommitHook: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, ctx: &HookContext<'_>, changes: &ChangeSet) -> StoreResult<HookVerdict>;
}

/// Rejects creations whose natural key is already taken on the branch.
///
/// Natural keys are configured per object type as the name of an attribute;
/// types without a configured key are not checked.
#[derive(Debug, Clone, Default)]
pub struct UniqueNaturalKeyHook {
    keys: BTreeMap<String, String>,
}

impl UniqueNaturalKeyHook {
    pub fn new(keys: BTreeMap<String, String>) -> Self {
        Self { keys }
    }
}

impl CommitHook for UniqueNaturalKeyHook {
    fn name(&self) -> &str {
        "unique-natural-key"
    }

    fn validate(&self, ctx: &HookContext<'_>, changes: &ChangeSet) -> StoreResult<HookVerdict> {
        let mut staged: BTreeSet<(String, String)> = BTreeSet::new();

        for (object, attributes) in changes.created() {
            let Some(attribute) = self.keys.get(object.object_type()) else {
                continue;
            };
            let Some(value) = attributes.get(attribute).filter(|v| !v.is_null()) else {
                continue;
            };

            if !staged.insert((object.object_type().to_string(), key_text(value))) {
                return Ok(HookVerdict::Reject(format!(
                    "{} {} = {} is created twice",
                    object.object_type(),
                    attribute,
                    value
                )));
            }

            let existing = ctx
                .revisions
                .find_by_attribute(object.object_type(), attribute, value, ctx.chain)?;
            if let Some(other) = existing.iter().find(|rev| &rev.object != object) {
                return Ok(HookVerdict::Reject(format!(
                    "{} {} = {} is already used by {}",
                    object, attribute, value, other.object
                )));
            }
        }

        Ok(HookVerdict::Accept)
    }
}

fn key_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
