use crate::branch::{Branch, BranchPath};
use crate::clock::Timestamp;
use crate::revision::types::Revision;

/// One level of a resolution chain: a branch segment, the latest timestamp
/// visible on it and the base that segment forked from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub segment: BranchPath,
    pub bound: Timestamp,
    pub base: Timestamp,
}

impl ChainLink {
    /// Whether `revision` is visible on this level.
    ///
    /// Revisions recorded at or before the level's base belong to an earlier
    /// fork of the segment; a rebase carries forward what is still wanted.
    pub fn admits(&self, revision: &Revision) -> bool {
        revision.segment == self.segment && revision.created > self.base && revision.is_visible_at(self.bound)
    }
}

/// Segments consulted when resolving an object on a branch, most specific
/// first, each with its own visibility bound.
///
/// The first bound is the requested timestamp clamped to the branch head, so
/// revisions of an unpublished commit are never visible. Every ancestor level
/// is further bounded by the base of the branch below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChain {
    links: Vec<ChainLink>,
}

impl ReadChain {
    /// Build a chain from `branches`, ordered from the target branch to `MAIN`.
    pub fn new(branches: &[Branch], at: Option<Timestamp>) -> Self {
        let mut links = Vec::with_capacity(branches.len());
        let mut bound = match (branches.first(), at) {
            (Some(head), Some(at)) => at.min(head.head_timestamp),
            (Some(head), None) => head.head_timestamp,
            (None, _) => return Self { links },
        };

        for branch in branches {
            links.push(ChainLink {
                segment: branch.path.clone(),
                bound,
                base: branch.base_timestamp,
            });
            bound = bound.min(branch.base_timestamp);
        }

        Self { links }
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    pub fn segments(&self) -> impl Iterator<Item = &BranchPath> {
        self.links.iter().map(|link| &link.segment)
    }

    /// Bound of the target branch itself.
    pub fn read_timestamp(&self) -> Option<Timestamp> {
        self.links.first().map(|link| link.bound)
    }

    pub fn branch(&self) -> Option<&BranchPath> {
        self.links.first().map(|link| &link.segment)
    }

    pub fn bound_of(&self, segment: &BranchPath) -> Option<Timestamp> {
        self.links
            .iter()
            .find(|link| &link.segment == segment)
            .map(|link| link.bound)
    }

    /// The chain as it will read once the target branch forks at `base`.
    ///
    /// The parent becomes visible up to `base` even though the target head
    /// has not moved past it yet; the pending commit will.
    pub fn with_base(&self, base: Timestamp) -> Self {
        let mut links = self.links.clone();
        if let Some(first) = links.first_mut() {
            first.base = base;
        }
        let mut bound = base;
        for i in 1..links.len() {
            links[i].bound = bound;
            bound = bound.min(links[i].base);
        }
        Self { links }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn branch(path: &str, base: Timestamp, head: Timestamp) -> Branch {
        let mut b = Branch::root(base);
        b.path = BranchPath::new(path).unwrap();
        b.base_timestamp = base;
        b.head_timestamp = head;
        b
    }

    #[test]
    fn test_bounds_narrow_up_the_chain() {
        let chain = ReadChain::new(
            &[branch("MAIN/a/b", 30, 50), branch("MAIN/a", 20, 40), branch("MAIN", 0, 60)],
            None,
        );
        let bounds: Vec<_> = chain.links().iter().map(|l| l.bound).collect();
        assert_eq!(bounds, vec![50, 30, 20]);
    }

    #[test]
    fn test_time_travel_clamps_to_head() {
        let chain = ReadChain::new(&[branch("MAIN/a", 20, 40), branch("MAIN", 0, 60)], Some(100));
        assert_eq!(chain.read_timestamp(), Some(40));

        let chain = ReadChain::new(&[branch("MAIN/a", 20, 40), branch("MAIN", 0, 60)], Some(10));
        let bounds: Vec<_> = chain.links().iter().map(|l| l.bound).collect();
        assert_eq!(bounds, vec![10, 10]);
    }

    #[test]
    fn test_with_base_moves_parent_bound() {
        let main = branch("MAIN", 0, 60);
        let mut child = Branch::fork(&branch("MAIN", 0, 20), BranchPath::new("MAIN/a").unwrap(), BTreeMap::new());
        child.head_timestamp = 45;

        let chain = ReadChain::new(&[child, main], None);
        assert_eq!(chain.bound_of(&BranchPath::main()), Some(20));

        let rebased = chain.with_base(60);
        assert_eq!(rebased.read_timestamp(), Some(45));
        assert_eq!(rebased.bound_of(&BranchPath::main()), Some(60));
        assert_eq!(rebased.links()[0].base, 60);
    }

    #[test]
    fn test_level_admits_only_revisions_after_its_base() {
        let chain = ReadChain::new(&[branch("MAIN/a", 20, 50), branch("MAIN", 0, 60)], None);
        let child = BranchPath::new("MAIN/a").unwrap();
        let object = crate::revision::ObjectId::new("concept", "1").unwrap();
        let at = |created| Revision::tombstone(object.clone(), child.clone(), created, "c");

        assert!(chain.links()[0].admits(&at(30)));
        assert!(!chain.links()[0].admits(&at(20)));
        assert!(!chain.links()[0].admits(&at(55)));
        assert!(!chain.links()[1].admits(&at(10)));

        // work done before a rebase is no longer part of the branch
        let rebased = chain.with_base(40);
        assert!(!rebased.links()[0].admits(&at(30)));
        assert!(rebased.links()[0].admits(&at(45)));
    }
}
