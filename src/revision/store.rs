//! Revision lookup and copy-on-write resolution.
//!
//! ```text
//!   get(X, MAIN/a/b, t)
//!
//!   MAIN/a/b  [created <= t            < replaced]   hit? -> done
//!      |
//!   MAIN/a    [created <= min(t, base_b) < replaced]  hit? -> done
//!      |
//!   MAIN      [created <= min(.., base_a) < replaced] hit? -> done
//! ```
//!
//! A single search fetches every revision of the object on the chain's
//! segments; the levels are then checked in order and the first hit wins. A
//! tombstone hit means the object is absent on that branch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::branch::BranchPath;
use crate::clock::Timestamp;
use crate::error::StoreResult;
use crate::retry::RetryPolicy;
use crate::revision::chain::ReadChain;
use crate::revision::types::{ObjectId, Revision, RevisionRef};
use crate::storage::{CollectionName, Document, DocumentIndex, Filter, StorageError, StorageResult};

/// Read access to the `revisions` collection.
#[derive(Clone)]
pub struct RevisionStore {
    index: Arc<dyn DocumentIndex>,
    retry: RetryPolicy,
}

impl RevisionStore {
    pub fn new(index: Arc<dyn DocumentIndex>, retry: RetryPolicy) -> Self {
        Self { index, retry }
    }

    /// Serialize a revision into its index document.
    pub fn to_document(revision: &Revision) -> StorageResult<Document> {
        Document::from_serialize(revision.key()?, revision)
    }

    fn search(&self, filter: &Filter) -> StoreResult<Vec<Revision>> {
        let collection = CollectionName::revisions();
        let docs = self
            .retry
            .run("search revisions", || self.index.search(&collection, filter))?;
        docs.iter()
            .map(|doc| doc.to_payload::<Revision>().map_err(Into::into))
            .collect()
    }

    fn on_chain(chain: &ReadChain) -> Filter {
        Filter::one_of("segment", chain.segments().map(|s| s.to_string()))
    }

    /// Load one revision by reference.
    pub fn load(&self, object: &ObjectId, revision: &RevisionRef) -> StoreResult<Option<Revision>> {
        let key = Revision::doc_key(object, &revision.segment, revision.created).map_err(StorageError::from)?;
        let collection = CollectionName::revisions();
        let doc = self
            .retry
            .run("load revision", || self.index.get(&collection, &key))?;
        doc.map(|d| d.to_payload::<Revision>().map_err(Into::into)).transpose()
    }

    /// Every revision of `object` on the given segments, in key order.
    pub fn history<'a>(
        &self,
        object: &ObjectId,
        segments: impl IntoIterator<Item = &'a BranchPath>,
    ) -> StoreResult<Vec<Revision>> {
        let filter = Filter::eq("object", object.to_string())
            .and(Filter::one_of("segment", segments.into_iter().map(|s| s.to_string())));
        self.search(&filter)
    }

    /// Revision that decides the state of `object` on the chain, tombstones
    /// included.
    pub fn resolve(&self, object: &ObjectId, chain: &ReadChain) -> StoreResult<Option<Revision>> {
        let candidates = self.history(object, chain.segments())?;
        Ok(pick(&candidates, chain).cloned())
    }

    /// Live revision of `object` on the chain, if any.
    pub fn get(&self, object: &ObjectId, chain: &ReadChain) -> StoreResult<Option<Revision>> {
        Ok(self.resolve(object, chain)?.filter(|rev| !rev.deleted))
    }

    /// Resolve many objects with one search. Objects with no revision on the
    /// chain are absent from the result; tombstones are kept.
    pub fn resolve_many(
        &self,
        objects: &BTreeSet<ObjectId>,
        chain: &ReadChain,
    ) -> StoreResult<BTreeMap<ObjectId, Revision>> {
        if objects.is_empty() {
            return Ok(BTreeMap::new());
        }
        let filter = Filter::one_of("object", objects.iter().map(|o| o.to_string())).and(Self::on_chain(chain));
        Ok(resolve_grouped(self.search(&filter)?, chain, false))
    }

    /// Every live object visible on the chain, optionally limited to one type.
    pub fn visible(&self, chain: &ReadChain, object_type: Option<&str>) -> StoreResult<BTreeMap<ObjectId, Revision>> {
        let mut filter = Self::on_chain(chain);
        if let Some(object_type) = object_type {
            filter = filter.and(Filter::prefix("object", format!("{}:", object_type)));
        }
        Ok(resolve_grouped(self.search(&filter)?, chain, true))
    }

    /// Objects that received a revision on `segment` within `(after, upto]`.
    pub fn touched(&self, segment: &BranchPath, after: Timestamp, upto: Timestamp) -> StoreResult<BTreeSet<ObjectId>> {
        if upto <= after {
            return Ok(BTreeSet::new());
        }
        let filter = Filter::eq("segment", segment.to_string())
            .and(Filter::gt("created", after))
            .and(Filter::lte("created", upto));
        Ok(self.search(&filter)?.into_iter().map(|rev| rev.object).collect())
    }

    /// Live objects whose structural container is `container`.
    pub fn contained_in(&self, container: &ObjectId, chain: &ReadChain) -> StoreResult<Vec<Revision>> {
        let filter = Filter::eq("container", container.to_string()).and(Self::on_chain(chain));
        let objects: BTreeSet<ObjectId> = self.search(&filter)?.into_iter().map(|rev| rev.object).collect();

        // an older revision may have pointed at the container while the
        // current one does not, so re-resolve before trusting the match
        Ok(self
            .resolve_many(&objects, chain)?
            .into_values()
            .filter(|rev| !rev.deleted && rev.container.as_ref() == Some(container))
            .collect())
    }

    /// Live objects of `object_type` whose `attribute` equals `value`.
    pub fn find_by_attribute(
        &self,
        object_type: &str,
        attribute: &str,
        value: &Value,
        chain: &ReadChain,
    ) -> StoreResult<Vec<Revision>> {
        let filter = Filter::prefix("object", format!("{}:", object_type))
            .and(Filter::eq(&format!("attributes.{}", attribute), value.clone()))
            .and(Self::on_chain(chain));
        let objects: BTreeSet<ObjectId> = self.search(&filter)?.into_iter().map(|rev| rev.object).collect();

        Ok(self
            .resolve_many(&objects, chain)?
            .into_values()
            .filter(|rev| !rev.deleted && rev.attributes.get(attribute) == Some(value))
            .collect())
    }
}

/// First revision visible on the chain, walking from the most specific level.
fn pick<'a>(candidates: &'a [Revision], chain: &ReadChain) -> Option<&'a Revision> {
    chain
        .links()
        .iter()
        .find_map(|link| candidates.iter().find(|rev| link.admits(rev)))
}

fn resolve_grouped(revisions: Vec<Revision>, chain: &ReadChain, live_only: bool) -> BTreeMap<ObjectId, Revision> {
    let mut grouped: BTreeMap<ObjectId, Vec<Revision>> = BTreeMap::new();
    for rev in revisions {
        grouped.entry(rev.object.clone()).or_default().push(rev);
    }

    grouped
        .into_iter()
        .filter_map(|(object, revs)| {
            let winner = pick(&revs, chain)?;
            if live_only && winner.deleted {
                return None;
            }
            Some((object, winner.clone()))
        })
        .collect()
}
