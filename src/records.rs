//! Record & Relationship Manager.
//!
//! Owns record identity and the typed relationship graph. Records live in a
//! flat keyed store and edges reference other records by `unique_id`, so
//! cycles and dangling references are ordinary data rather than ownership
//! problems.
//!
//! - [`upsert`](RecordManager::upsert) replaces a record in place (no field
//!   merge), assigning a `unique_id` on first write.
//! - Writes are last-writer-wins by `updated_at`, and conflicting concurrent
//!   writes are retried against the store's revision check. A write that
//!   changes no content is a no-op.
//! - [`resolve`](RecordManager::resolve) never fails for a missing or
//!   tombstoned target; it reports [`RelationshipTargetMissing`].
//! - Symmetric edge types are not mirrored: a `parent` edge does not create
//!   the matching `child` edge. Add both when both directions are needed.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Provenance, Record, Relationship, RelationshipType};
use crate::store::{RecordFilter, Store};

/// Upper bound on re-read/retry cycles after a write conflict.
pub(crate) const MAX_WRITE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    Created(Record),
    Updated(Record),
    /// Identical content: nothing written, whatever the timestamps say.
    Unchanged(Record),
    /// Older than the stored record: nothing written. Carries the stored record.
    Stale(Record),
}

impl UpsertOutcome {
    pub fn record(&self) -> &Record {
        match self {
            UpsertOutcome::Created(r)
            | UpsertOutcome::Updated(r)
            | UpsertOutcome::Unchanged(r)
            | UpsertOutcome::Stale(r) => r,
        }
    }

    pub fn into_record(self) -> Record {
        match self {
            UpsertOutcome::Created(r)
            | UpsertOutcome::Updated(r)
            | UpsertOutcome::Unchanged(r)
            | UpsertOutcome::Stale(r) => r,
        }
    }

    pub fn wrote(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_) | UpsertOutcome::Updated(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingReason {
    /// No record with this id has been materialized (yet).
    Absent,
    Tombstoned,
}

/// A relationship whose target cannot be followed right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipTargetMissing {
    pub target_unique_id: String,
    pub reason: MissingReason,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Found(Record),
    Missing(RelationshipTargetMissing),
}

impl Resolution {
    pub fn found(&self) -> Option<&Record> {
        match self {
            Resolution::Found(r) => Some(r),
            Resolution::Missing(_) => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Resolution::Missing(_))
    }
}

/// An outgoing edge together with the state of its target.
#[derive(Debug, Clone)]
pub struct ResolvedEdge {
    pub edge: Relationship,
    pub resolution: Resolution,
}

#[derive(Clone)]
pub struct RecordManager {
    store: Arc<dyn Store>,
}

impl RecordManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn get(&self, unique_id: &str) -> Result<Option<Record>, StoreError> {
        self.store.get(unique_id).await
    }

    /// Look up a record by its provenance key, tombstones included.
    pub async fn find_by_source(&self, provenance: &Provenance) -> Result<Option<Record>, StoreError> {
        let filter = RecordFilter {
            source: Some(provenance.key()),
            external_id: Some(provenance.external_id.clone()),
            include_deleted: true,
            limit: Some(1),
            ..Default::default()
        };
        Ok(self.store.scan(&filter).await?.into_iter().next())
    }

    async fn locate(&self, record: &Record) -> Result<Option<Record>, StoreError> {
        if !record.unique_id.is_empty() {
            return self.store.get(&record.unique_id).await;
        }
        match &record.provenance {
            Some(p) => self.find_by_source(p).await,
            None => Ok(None),
        }
    }

    /// Insert or replace a record keyed by `unique_id`.
    ///
    /// A record without `unique_id` but with provenance replaces the record
    /// already stored under that provenance, if any; otherwise it gets the
    /// id derived from its provenance, or a random one without provenance.
    /// `created_at` of an existing record is preserved, and a stored
    /// embedding survives when the incoming record carries none and the
    /// text did not change.
    pub async fn upsert(&self, mut record: Record) -> Result<UpsertOutcome, StoreError> {
        record.normalize();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            match self.locate(&record).await? {
                None => {
                    let mut fresh = record.clone();
                    if fresh.unique_id.is_empty() {
                        fresh.unique_id = match &fresh.provenance {
                            Some(p) => p.unique_id(),
                            None => Uuid::new_v4().to_string(),
                        };
                    }
                    fresh.revision = 0;
                    match self.store.create(&fresh).await {
                        Ok(stored) => return Ok(UpsertOutcome::Created(stored)),
                        Err(StoreError::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Some(stored) => {
                    let candidate = replace_onto(&record, &stored);
                    if candidate.content_hash() == stored.content_hash() {
                        return Ok(UpsertOutcome::Unchanged(stored));
                    }
                    if candidate.updated_at < stored.updated_at {
                        tracing::debug!(
                            unique_id = %stored.unique_id,
                            "ignoring write older than stored record"
                        );
                        return Ok(UpsertOutcome::Stale(stored));
                    }
                    match self.store.update(&stored.unique_id, &candidate).await {
                        Ok(updated) => return Ok(UpsertOutcome::Updated(updated)),
                        Err(StoreError::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(StoreError::Conflict(if record.unique_id.is_empty() {
            record
                .provenance
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default()
        } else {
            record.unique_id
        }))
    }

    /// Read-modify-write with optimistic retry. `change` returns `false`
    /// when there is nothing to write; the record is then returned as is.
    pub(crate) async fn modify<F>(&self, unique_id: &str, mut change: F) -> Result<Record, StoreError>
    where
        F: FnMut(&mut Record) -> bool + Send,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut record = self
                .store
                .get(unique_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(unique_id.to_string()))?;
            if !change(&mut record) {
                return Ok(record);
            }
            record.normalize();
            record.touch();
            match self.store.update(unique_id, &record).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict(unique_id.to_string()))
    }

    /// Append an edge to `source_id`. Adding an edge that already exists
    /// (same target and type) changes nothing. A `member_of` edge replaces
    /// any previous one, since a record belongs to at most one collection.
    pub async fn add_relationship(
        &self,
        source_id: &str,
        edge: Relationship,
    ) -> Result<Record, StoreError> {
        self.modify(source_id, |record| {
            if record.relationships.iter().any(|r| r.same_edge(&edge)) {
                return false;
            }
            if edge.rel_type == RelationshipType::MemberOf {
                record
                    .relationships
                    .retain(|r| r.rel_type != RelationshipType::MemberOf);
            }
            record.relationships.push(edge.clone());
            true
        })
        .await
    }

    pub async fn remove_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: &RelationshipType,
    ) -> Result<Record, StoreError> {
        self.modify(source_id, |record| {
            let before = record.relationships.len();
            record
                .relationships
                .retain(|r| !(r.target_unique_id == target_id && &r.rel_type == rel_type));
            record.relationships.len() != before
        })
        .await
    }

    /// Resolve an edge target. Missing and tombstoned targets are reported,
    /// not raised.
    pub async fn resolve(&self, target_id: &str) -> Result<Resolution, StoreError> {
        Ok(match self.store.get(target_id).await? {
            Some(record) if !record.is_tombstoned() => Resolution::Found(record),
            Some(_) => Resolution::Missing(RelationshipTargetMissing {
                target_unique_id: target_id.to_string(),
                reason: MissingReason::Tombstoned,
            }),
            None => Resolution::Missing(RelationshipTargetMissing {
                target_unique_id: target_id.to_string(),
                reason: MissingReason::Absent,
            }),
        })
    }

    /// All outgoing edges of a record, each with its resolved target.
    pub async fn relationships(&self, source_id: &str) -> Result<Vec<ResolvedEdge>, StoreError> {
        let record = self
            .store
            .get(source_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(source_id.to_string()))?;

        let mut resolved = Vec::with_capacity(record.relationships.len());
        for edge in record.relationships {
            let resolution = self.resolve(&edge.target_unique_id).await?;
            resolved.push(ResolvedEdge { edge, resolution });
        }
        Ok(resolved)
    }

    /// Breadth-first walk over outgoing edges, optionally of one type.
    ///
    /// Visits each record once, so cycles terminate. Missing targets are
    /// skipped. The start record is not included in the result.
    pub async fn traverse(
        &self,
        start_id: &str,
        max_depth: usize,
        rel_type: Option<&RelationshipType>,
    ) -> Result<Vec<Record>, StoreError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        let mut reached = Vec::new();

        visited.insert(start_id.to_string());
        queue.push_back((start_id.to_string(), 0));

        while let Some((id, depth)) = queue.pop_front() {
            let Some(record) = self.store.get(&id).await? else {
                continue;
            };
            if record.is_tombstoned() {
                continue;
            }
            if depth < max_depth {
                for edge in &record.relationships {
                    if rel_type.is_some_and(|t| *t != edge.rel_type) {
                        continue;
                    }
                    if visited.insert(edge.target_unique_id.clone()) {
                        queue.push_back((edge.target_unique_id.clone(), depth + 1));
                    }
                }
            }
            if id != start_id {
                reached.push(record);
            }
        }

        Ok(reached)
    }

    /// Mark a record deleted. Idempotent; other records' edges to it stay.
    pub async fn tombstone(&self, unique_id: &str) -> Result<Record, StoreError> {
        match self.store.get(unique_id).await? {
            Some(record) if record.is_tombstoned() => Ok(record),
            Some(_) => self.store.tombstone(unique_id).await,
            None => Err(StoreError::NotFound(unique_id.to_string())),
        }
    }
}

/// The incoming record as it will be written over `stored`.
fn replace_onto(incoming: &Record, stored: &Record) -> Record {
    let mut candidate = incoming.clone();
    candidate.unique_id = stored.unique_id.clone();
    candidate.created_at = stored.created_at;
    candidate.revision = stored.revision;
    if candidate.embedding.is_none()
        && stored.embedding.is_some()
        && candidate.text_content == stored.text_content
    {
        candidate.embedding = stored.embedding.clone();
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now, RecordStatus, SourceKey};
    use crate::store::memory::InMemoryStore;
    use chrono::Duration;

    fn manager() -> RecordManager {
        RecordManager::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_upsert_assigns_id_once() {
        let records = manager();
        let created = records.upsert(Record::new("a", "body")).await.unwrap();
        let UpsertOutcome::Created(created) = created else {
            panic!("expected Created");
        };
        assert!(!created.unique_id.is_empty());

        let mut again = created.clone();
        again.text_content = "changed".into();
        again.touch();
        let updated = records.upsert(again).await.unwrap();
        assert!(matches!(updated, UpsertOutcome::Updated(_)));
        assert_eq!(updated.record().unique_id, created.unique_id);
        assert_eq!(updated.record().created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_identical_upsert_is_noop() {
        let records = manager();
        let record = Record::new("a", "body").with_id("r1");
        records.upsert(record.clone()).await.unwrap();
        let first = records.get("r1").await.unwrap().unwrap();

        let outcome = records.upsert(record.clone()).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Unchanged(_)));
        let later = record.with_updated_at(now() + Duration::seconds(5));
        let outcome = records.upsert(later).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Unchanged(_)));

        let second = records.get("r1").await.unwrap().unwrap();
        assert_eq!(first.updated_at, second.updated_at);
        assert_eq!(first.revision, second.revision);
    }

    #[tokio::test]
    async fn test_upsert_replaces_rather_than_merges() {
        let records = manager();
        records
            .upsert(Record::new("a", "body").with_id("r1").with_tag("old").with_metadata("k", 1))
            .await
            .unwrap();
        let replacement = Record::new("a", "body")
            .with_id("r1")
            .with_updated_at(now() + Duration::seconds(1));
        records.upsert(replacement).await.unwrap();

        let stored = records.get("r1").await.unwrap().unwrap();
        assert!(stored.tags.is_empty());
        assert!(stored.custom_metadata.is_empty());
    }

    #[tokio::test]
    async fn test_older_write_is_stale() {
        let records = manager();
        let t = now();
        records
            .upsert(Record::new("new", "v2").with_id("r1").with_updated_at(t))
            .await
            .unwrap();
        let outcome = records
            .upsert(
                Record::new("old", "v1")
                    .with_id("r1")
                    .with_updated_at(t - Duration::seconds(10)),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Stale(_)));
        assert_eq!(records.get("r1").await.unwrap().unwrap().title, "new");
    }

    #[tokio::test]
    async fn test_provenance_reuses_existing_record() {
        let records = manager();
        let key = SourceKey::new("filesystem", "notes");
        let mut first = Record::new("a", "v1");
        first.provenance = Some(Provenance::new(&key, "a.md"));
        let created = records.upsert(first.clone()).await.unwrap().into_record();

        let mut second = first.with_updated_at(now() + Duration::seconds(1));
        second.text_content = "v2".into();
        let updated = records.upsert(second).await.unwrap();
        assert_eq!(created.unique_id, Provenance::new(&key, "a.md").unique_id());
        assert_eq!(updated.record().unique_id, created.unique_id);
        assert_eq!(
            records.store().scan(&RecordFilter::default()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_embedding_survives_replacement_with_same_text() {
        let records = manager();
        records
            .upsert(Record::new("a", "body").with_id("r1").with_embedding(vec![1.0, 2.0]))
            .await
            .unwrap();
        records
            .upsert(
                Record::new("renamed", "body")
                    .with_id("r1")
                    .with_updated_at(now() + Duration::seconds(1)),
            )
            .await
            .unwrap();
        let stored = records.get("r1").await.unwrap().unwrap();
        assert_eq!(stored.embedding, Some(vec![1.0, 2.0]));
    }

    #[tokio::test]
    async fn test_add_relationship_is_idempotent_and_not_mirrored() {
        let records = manager();
        records.upsert(Record::new("p", "").with_id("parent")).await.unwrap();
        records.upsert(Record::new("c", "").with_id("child")).await.unwrap();

        let edge = Relationship::new("parent", RelationshipType::Parent);
        records.add_relationship("child", edge.clone()).await.unwrap();
        let once = records.get("child").await.unwrap().unwrap();
        records.add_relationship("child", edge).await.unwrap();
        let twice = records.get("child").await.unwrap().unwrap();

        assert_eq!(twice.relationships.len(), 1);
        assert_eq!(once.updated_at, twice.updated_at);
        let parent = records.get("parent").await.unwrap().unwrap();
        assert!(parent.relationships.is_empty());
    }

    #[tokio::test]
    async fn test_dangling_edge_resolves_as_missing() {
        let records = manager();
        records.upsert(Record::new("a", "").with_id("a")).await.unwrap();
        records
            .add_relationship("a", Relationship::new("not-yet", RelationshipType::Reference))
            .await
            .unwrap();

        let edges = records.relationships("a").await.unwrap();
        assert_eq!(edges.len(), 1);
        match &edges[0].resolution {
            Resolution::Missing(m) => {
                assert_eq!(m.target_unique_id, "not-yet");
                assert_eq!(m.reason, MissingReason::Absent);
            }
            Resolution::Found(_) => panic!("target should be missing"),
        }

        records.upsert(Record::new("late", "").with_id("not-yet")).await.unwrap();
        assert!(records.resolve("not-yet").await.unwrap().found().is_some());
    }

    #[tokio::test]
    async fn test_tombstone_keeps_incoming_edges() {
        let records = manager();
        records.upsert(Record::new("a", "").with_id("a")).await.unwrap();
        records
            .upsert(
                Record::new("b", "")
                    .with_id("b")
                    .with_relationship(Relationship::new("a", RelationshipType::Related)),
            )
            .await
            .unwrap();

        let tomb = records.tombstone("a").await.unwrap();
        assert_eq!(tomb.status, RecordStatus::Deleted);
        let again = records.tombstone("a").await.unwrap();
        assert_eq!(tomb.revision, again.revision);

        let b = records.get("b").await.unwrap().unwrap();
        assert_eq!(b.relationships.len(), 1);
        match records.resolve("a").await.unwrap() {
            Resolution::Missing(m) => assert_eq!(m.reason, MissingReason::Tombstoned),
            Resolution::Found(_) => panic!("tombstoned target should not resolve"),
        }
    }

    #[tokio::test]
    async fn test_traverse_handles_cycles() {
        let records = manager();
        for (id, next) in [("a", "b"), ("b", "c"), ("c", "a")] {
            records
                .upsert(
                    Record::new(id, "")
                        .with_id(id)
                        .with_relationship(Relationship::new(next, RelationshipType::Related)),
                )
                .await
                .unwrap();
        }
        records
            .add_relationship("b", Relationship::new("ghost", RelationshipType::Related))
            .await
            .unwrap();

        let reached = records.traverse("a", 10, None).await.unwrap();
        let mut ids: Vec<&str> = reached.iter().map(|r| r.unique_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["b", "c"]);

        let shallow = records.traverse("a", 1, None).await.unwrap();
        assert_eq!(shallow.len(), 1);
    }

    #[tokio::test]
    async fn test_member_of_edge_moves_collection() {
        let records = manager();
        records.upsert(Record::new("m", "").with_id("m")).await.unwrap();
        records
            .add_relationship("m", Relationship::member_of("h1", None))
            .await
            .unwrap();
        let moved = records
            .add_relationship("m", Relationship::member_of("h2", None))
            .await
            .unwrap();
        assert_eq!(moved.collection(), Some("h2"));
        assert_eq!(moved.relationships.len(), 1);

        let removed = records
            .remove_relationship("m", "h2", &RelationshipType::MemberOf)
            .await
            .unwrap();
        assert_eq!(removed.collection(), None);
    }
}
