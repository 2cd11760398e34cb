//! In-memory [`Store`] implementation for testing and embedding.
//!
//! Uses a `HashMap` behind `std::sync::RwLock` for thread safety.
//! Vector search is brute-force cosine similarity over all stored vectors.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::StoreError;
use crate::models::{next_ts, Record, RecordStatus, ScoredRecord};

use super::{RecordFilter, Store};

/// In-memory store for tests and short-lived processes.
pub struct InMemoryStore {
    records: RwLock<HashMap<String, Record>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored records, tombstones and reserved records included.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("in-memory store lock poisoned".to_string())
}

fn provenance_taken(records: &HashMap<String, Record>, candidate: &Record) -> bool {
    let Some(p) = &candidate.provenance else {
        return false;
    };
    records
        .values()
        .any(|r| {
            r.unique_id != candidate.unique_id
                && r.provenance.as_ref().is_some_and(|q| q.same_item(p))
        })
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create(&self, record: &Record) -> Result<Record, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        if records.contains_key(&record.unique_id) || provenance_taken(&records, record) {
            return Err(StoreError::Conflict(record.unique_id.clone()));
        }
        let mut stored = record.clone();
        stored.revision = 1;
        records.insert(stored.unique_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, unique_id: &str, record: &Record) -> Result<Record, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let current = records
            .get(unique_id)
            .ok_or_else(|| StoreError::NotFound(unique_id.to_string()))?;
        if current.revision != record.revision || provenance_taken(&records, record) {
            return Err(StoreError::Conflict(unique_id.to_string()));
        }
        let mut stored = record.clone();
        stored.unique_id = unique_id.to_string();
        stored.revision = record.revision + 1;
        records.insert(unique_id.to_string(), stored.clone());
        Ok(stored)
    }

    async fn tombstone(&self, unique_id: &str) -> Result<Record, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let stored = records
            .get_mut(unique_id)
            .ok_or_else(|| StoreError::NotFound(unique_id.to_string()))?;
        stored.status = RecordStatus::Deleted;
        stored.updated_at = next_ts(stored.updated_at);
        stored.revision += 1;
        Ok(stored.clone())
    }

    async fn get(&self, unique_id: &str) -> Result<Option<Record>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(unique_id).cloned())
    }

    async fn scan(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut matched: Vec<Record> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.unique_id.cmp(&b.unique_id))
        });
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut candidates: Vec<ScoredRecord> = records
            .values()
            .filter(|r| filter.matches(r))
            .filter_map(|r| {
                let embedding = r.embedding.as_ref()?;
                Some(ScoredRecord {
                    score: cosine_similarity(query, embedding),
                    record: r.clone(),
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(k);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now, Provenance, RecordType, SourceKey};

    fn doc(id: &str) -> Record {
        Record::new(format!("title {}", id), "body").with_id(id)
    }

    #[tokio::test]
    async fn test_create_then_conflict() {
        let store = InMemoryStore::new();
        let stored = store.create(&doc("a")).await.unwrap();
        assert_eq!(stored.revision, 1);
        let err = store.create(&doc("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_requires_matching_revision() {
        let store = InMemoryStore::new();
        let stored = store.create(&doc("a")).await.unwrap();

        let mut stale = stored.clone();
        stale.revision = 0;
        assert!(matches!(
            store.update("a", &stale).await.unwrap_err(),
            StoreError::Conflict(_)
        ));

        let mut fresh = stored.clone();
        fresh.title = "renamed".into();
        let updated = store.update("a", &fresh).await.unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(store.get("a").await.unwrap().unwrap().title, "renamed");
    }

    #[tokio::test]
    async fn test_duplicate_provenance_rejected() {
        let store = InMemoryStore::new();
        let key = SourceKey::new("fs", "notes");
        let mut a = doc("a");
        a.provenance = Some(Provenance::new(&key, "x.md"));
        let mut b = doc("b");
        // A different source version of the same item is still the same item.
        b.provenance = Some(Provenance::new(&key, "x.md").with_source_modified_at(now()));
        store.create(&a).await.unwrap();
        assert!(matches!(store.create(&b).await.unwrap_err(), StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_tombstone_hidden_from_default_scan() {
        let store = InMemoryStore::new();
        store.create(&doc("a")).await.unwrap();
        store.create(&doc("b")).await.unwrap();
        let tomb = store.tombstone("a").await.unwrap();
        assert!(tomb.is_tombstoned());

        let live = store.scan(&RecordFilter::default()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].unique_id, "b");

        let all = store
            .scan(&RecordFilter::default().including_deleted())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reserved_records_hidden_by_default() {
        let store = InMemoryStore::new();
        store
            .create(&doc("cp").with_type(RecordType::Checkpoint))
            .await
            .unwrap();
        store.create(&doc("d")).await.unwrap();

        assert_eq!(store.scan(&RecordFilter::default()).await.unwrap().len(), 1);
        let cps = store
            .scan(&RecordFilter::of_type(RecordType::Checkpoint))
            .await
            .unwrap();
        assert_eq!(cps.len(), 1);
    }

    #[tokio::test]
    async fn test_vector_search_ranks_by_similarity() {
        let store = InMemoryStore::new();
        store
            .create(&doc("x").with_embedding(vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .create(&doc("y").with_embedding(vec![0.0, 1.0]))
            .await
            .unwrap();
        store.create(&doc("z")).await.unwrap();

        let hits = store
            .vector_search(&[0.9, 0.1], 5, &RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.unique_id, "x");
    }
}
