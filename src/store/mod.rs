//! Record Store Facade.
//!
//! The [`Store`] trait is the boundary to the underlying storage engine:
//! atomic per-record create/update/tombstone, filtered scans, and k-NN
//! vector search. There are no multi-record transactions.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Optimistic writes
//!
//! Every stored record carries a `revision`. [`Store::update`] succeeds only
//! when the caller's `record.revision` equals the stored one, and returns
//! the record with the revision incremented. A mismatch yields
//! [`StoreError::Conflict`]; callers re-read and retry.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Record, RecordType, ScoredRecord, SourceKey};

/// Filter for [`Store::scan`] and [`Store::vector_search`].
///
/// Defaults exclude tombstoned records and reserved bookkeeping records
/// (checkpoints, sync leases) unless `record_type` asks for one.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub source: Option<SourceKey>,
    pub external_id: Option<String>,
    pub record_type: Option<RecordType>,
    pub collection: Option<String>,
    pub tag: Option<String>,
    pub include_deleted: bool,
    pub missing_embedding: bool,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn for_source(key: &SourceKey) -> Self {
        Self {
            source: Some(key.clone()),
            ..Default::default()
        }
    }

    pub fn for_collection(header_id: &str) -> Self {
        Self {
            collection: Some(header_id.to_string()),
            ..Default::default()
        }
    }

    pub fn of_type(record_type: RecordType) -> Self {
        Self {
            record_type: Some(record_type),
            ..Default::default()
        }
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// In-memory evaluation, shared by backends that filter after loading.
    pub fn matches(&self, record: &Record) -> bool {
        if record.is_tombstoned() && !self.include_deleted {
            return false;
        }
        match &self.record_type {
            Some(t) if *t != record.record_type => return false,
            None if record.record_type.is_reserved() => return false,
            _ => {}
        }
        if let Some(key) = &self.source {
            match &record.provenance {
                Some(p) if p.belongs_to(key) => {}
                _ => return false,
            }
        }
        if let Some(ext) = &self.external_id {
            match &record.provenance {
                Some(p) if &p.external_id == ext => {}
                _ => return false,
            }
        }
        if let Some(c) = &self.collection {
            if record.collection() != Some(c.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !record.tags.contains(tag) {
                return false;
            }
        }
        if self.missing_embedding && record.embedding.is_some() {
            return false;
        }
        true
    }
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create`](Store::create) | Insert a new record (revision becomes 1) |
/// | [`update`](Store::update) | Replace a record, guarded by revision |
/// | [`tombstone`](Store::tombstone) | Mark a record deleted, keep it readable |
/// | [`get`](Store::get) | Fetch by `unique_id`, tombstones included |
/// | [`scan`](Store::scan) | Filtered listing ordered by creation |
/// | [`vector_search`](Store::vector_search) | Cosine k-NN over embeddings |
#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `Conflict` if the id or the provenance key is taken.
    async fn create(&self, record: &Record) -> Result<Record, StoreError>;

    async fn update(&self, unique_id: &str, record: &Record) -> Result<Record, StoreError>;

    /// Sets `status = deleted` and advances `updated_at`. Edges pointing at
    /// the record from elsewhere are left untouched.
    async fn tombstone(&self, unique_id: &str) -> Result<Record, StoreError>;

    async fn get(&self, unique_id: &str) -> Result<Option<Record>, StoreError>;

    async fn scan(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError>;

    async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError>;
}
