//! Structural checks run on the merged state before a clean merge is
//! applied.
//!
//! The merged state is the target view with the staged changes laid over
//! it. Any failure is reported as an `InvariantViolation` conflict.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::StoreResult;
use crate::merge::conflict::Conflict;
use crate::merge::rules::{HierarchyRule, MergeRules, PreferredRule};
use crate::revision::{ObjectId, ObjectState, ReadChain, RevisionStore};

/// Target view overlaid with staged merge results. `None` marks a removal.
pub(crate) struct MergedView<'a> {
    revisions: &'a RevisionStore,
    chain: &'a ReadChain,
    staged: &'a BTreeMap<ObjectId, Option<ObjectState>>,
}

impl<'a> MergedView<'a> {
    pub fn new(
        revisions: &'a RevisionStore,
        chain: &'a ReadChain,
        staged: &'a BTreeMap<ObjectId, Option<ObjectState>>,
    ) -> Self {
        Self {
            revisions,
            chain,
            staged,
        }
    }

    pub fn get(&self, object: &ObjectId) -> StoreResult<Option<ObjectState>> {
        if let Some(staged) = self.staged.get(object) {
            return Ok(staged.clone());
        }
        Ok(self.revisions.get(object, self.chain)?.and_then(|rev| rev.state()))
    }

    pub fn of_type(&self, object_type: &str) -> StoreResult<BTreeMap<ObjectId, ObjectState>> {
        let mut live: BTreeMap<ObjectId, ObjectState> = self
            .revisions
            .visible(self.chain, Some(object_type))?
            .into_iter()
            .filter_map(|(object, rev)| rev.state().map(|s| (object, s)))
            .collect();
        for (object, staged) in self.staged.iter().filter(|(o, _)| o.object_type() == object_type) {
            match staged {
                Some(state) => {
                    live.insert(object.clone(), state.clone());
                }
                None => {
                    live.remove(object);
                }
            }
        }
        Ok(live)
    }

    fn staged_live(&self) -> impl Iterator<Item = (&ObjectId, &ObjectState)> {
        self.staged
            .iter()
            .filter_map(|(object, state)| state.as_ref().map(|s| (object, s)))
    }

    fn staged_removed(&self) -> impl Iterator<Item = &ObjectId> {
        self.staged
            .iter()
            .filter(|(_, state)| state.is_none())
            .map(|(object, _)| object)
    }
}

/// Run every configured check against the merged view.
pub(crate) fn check(rules: &MergeRules, view: &MergedView<'_>) -> StoreResult<Vec<Conflict>> {
    let mut conflicts = Vec::new();
    check_references(rules, view, &mut conflicts)?;
    for rule in &rules.preferred {
        check_preferred(rule, view, &mut conflicts)?;
    }
    for rule in &rules.hierarchy {
        check_acyclic(rule, view, &mut conflicts)?;
    }
    Ok(conflicts)
}

fn violation(object: &ObjectId, related: Option<&ObjectId>, message: String) -> Conflict {
    Conflict::InvariantViolation {
        object: object.clone(),
        related: related.cloned(),
        message,
    }
}

fn check_references(rules: &MergeRules, view: &MergedView<'_>, conflicts: &mut Vec<Conflict>) -> StoreResult<()> {
    for (object, state) in view.staged_live() {
        for target in rules.references_of(object, state) {
            if view.get(&target)?.is_none() {
                conflicts.push(violation(
                    object,
                    Some(&target),
                    format!("{} references {}, which does not exist after the merge", object, target),
                ));
            }
        }
    }

    // objects left pointing at something the merge removes
    for removed in view.staged_removed() {
        let mut dangling: BTreeSet<ObjectId> = view
            .revisions
            .contained_in(removed, view.chain)?
            .into_iter()
            .map(|rev| rev.object)
            .collect();
        for rule in rules.referencing(removed.object_type()) {
            let id = Value::String(removed.id().to_string());
            dangling.extend(
                view.revisions
                    .find_by_attribute(&rule.object_type, &rule.attribute, &id, view.chain)?
                    .into_iter()
                    .map(|rev| rev.object),
            );
        }
        for object in dangling.iter().filter(|o| !view.staged.contains_key(*o)) {
            conflicts.push(violation(
                object,
                Some(removed),
                format!("{} still references {}, which the merge removes", object, removed),
            ));
        }
    }
    Ok(())
}

fn check_preferred(rule: &PreferredRule, view: &MergedView<'_>, conflicts: &mut Vec<Conflict>) -> StoreResult<()> {
    let flagged = |state: &ObjectState| state.attribute(&rule.flag_attribute) == Some(&rule.flag_value);
    let touched: BTreeSet<&ObjectId> = view
        .staged_live()
        .filter(|(object, state)| object.object_type() == rule.object_type && flagged(*state))
        .map(|(object, _)| object)
        .collect();
    if touched.is_empty() {
        return Ok(());
    }

    let mut groups: BTreeMap<String, Vec<ObjectId>> = BTreeMap::new();
    for (object, state) in view.of_type(&rule.object_type)? {
        if !flagged(&state) {
            continue;
        }
        let Some(group) = state.attribute(&rule.group_attribute) else {
            continue;
        };
        groups.entry(group.to_string()).or_default().push(object);
    }

    for (group, members) in groups.iter().filter(|(_, m)| m.len() > 1) {
        let Some(first) = members.iter().find(|m| touched.contains(m)) else {
            continue;
        };
        let other = members.iter().find(|m| *m != first);
        conflicts.push(violation(
            first,
            other,
            format!(
                "{} {} objects are flagged {}={} for {} {}",
                members.len(),
                rule.object_type,
                rule.flag_attribute,
                rule.flag_value,
                rule.group_attribute,
                group
            ),
        ));
    }
    Ok(())
}

fn check_acyclic(rule: &HierarchyRule, view: &MergedView<'_>, conflicts: &mut Vec<Conflict>) -> StoreResult<()> {
    let staged_edges: Vec<(&ObjectId, (String, String))> = view
        .staged_live()
        .filter(|(object, state)| object.object_type() == rule.edge_type && rule.applies_to(state))
        .filter_map(|(object, state)| rule.endpoints(state).map(|e| (object, e)))
        .collect();
    if staged_edges.is_empty() {
        return Ok(());
    }

    let mut parents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for state in view.of_type(&rule.edge_type)?.values().filter(|s| rule.applies_to(s)) {
        if let Some((source, destination)) = rule.endpoints(state) {
            parents.entry(source).or_default().push(destination);
        }
    }

    for (edge, (source, destination)) in staged_edges {
        if reaches(&parents, &destination, &source) {
            conflicts.push(violation(
                edge,
                None,
                format!("{} makes {} its own ancestor", edge, source),
            ));
        }
    }
    Ok(())
}

/// True when `to` is reachable from `from` following edges.
fn reaches(edges: &BTreeMap<String, Vec<String>>, from: &str, to: &str) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = edges.get(node) {
            stack.extend(next.iter().map(String::as_str));
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::branch::Branch;
    use crate::retry::RetryPolicy;
    use crate::storage::MemoryIndex;

    fn id(object_type: &str, id: &str) -> ObjectId {
        ObjectId::new(object_type, id).unwrap()
    }

    fn state(attributes: Value) -> ObjectState {
        serde_json::from_value(json!({ "attributes": attributes })).unwrap()
    }

    fn is_a(source: &str, destination: &str) -> ObjectState {
        state(json!({"sourceId": source, "destinationId": destination, "typeId": "116680003"}))
    }

    fn run(staged: BTreeMap<ObjectId, Option<ObjectState>>) -> Vec<Conflict> {
        let revisions = RevisionStore::new(Arc::new(MemoryIndex::new()), RetryPolicy::none());
        let chain = ReadChain::new(&[Branch::root(1)], None);
        let view = MergedView::new(&revisions, &chain, &staged);
        check(&MergeRules::terminology(), &view).unwrap()
    }

    #[test]
    fn test_consistent_overlay_passes() {
        let staged = BTreeMap::from([
            (id("concept", "1"), Some(ObjectState::default())),
            (id("concept", "2"), Some(ObjectState::default())),
            (id("concept", "116680003"), Some(ObjectState::default())),
            (id("relationship", "r1"), Some(is_a("1", "2"))),
        ]);
        assert!(run(staged).is_empty());
    }

    #[test]
    fn test_dangling_reference() {
        let staged = BTreeMap::from([(
            id("description", "d1"),
            Some(state(json!({"conceptId": "404"}))),
        )]);
        let conflicts = run(staged);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].object_b(), Some(&id("concept", "404")));
    }

    #[test]
    fn test_two_preferred_in_group() {
        let preferred = |concept: &str| Some(state(json!({"conceptId": concept, "preferred": true})));
        let staged = BTreeMap::from([
            (id("concept", "1"), Some(ObjectState::default())),
            (id("description", "d1"), preferred("1")),
            (id("description", "d2"), preferred("1")),
        ]);
        let conflicts = run(staged);
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].message().contains("preferred=true"));
    }

    #[test]
    fn test_cycle_detected() {
        let staged = BTreeMap::from([
            (id("concept", "1"), Some(ObjectState::default())),
            (id("concept", "2"), Some(ObjectState::default())),
            (id("concept", "116680003"), Some(ObjectState::default())),
            (id("relationship", "r1"), Some(is_a("1", "2"))),
            (id("relationship", "r2"), Some(is_a("2", "1"))),
        ]);
        let conflicts = run(staged);
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.iter().all(|c| c.message().contains("its own ancestor")));
    }

    #[test]
    fn test_reaches() {
        let edges = BTreeMap::from([
            ("a".to_string(), vec!["b".to_string()]),
            ("b".to_string(), vec!["c".to_string()]),
        ]);
        assert!(reaches(&edges, "a", "c"));
        assert!(!reaches(&edges, "c", "a"));
    }
}
