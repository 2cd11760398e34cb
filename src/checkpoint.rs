//! Durable sync checkpoints.
//!
//! One checkpoint per `(dataset, source_type, source_identity)`, stored as a
//! reserved `checkpoint` record in the same store as the data it describes.
//! The engine saves it only after a batch of upserts has been confirmed.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::models::{next_ts, normalize_ts, Record, RecordStatus, RecordType, SourceKey};
use crate::records::MAX_WRITE_ATTEMPTS;
use crate::store::{RecordFilter, Store};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub dataset: String,
    pub source: SourceKey,
    /// Never moves backwards once saved.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Opaque adapter resumption token.
    pub cursor: Option<String>,
    /// External ids seen by the last complete full run with deletion
    /// detection enabled.
    pub known_external_ids: BTreeSet<String>,
}

impl Checkpoint {
    pub fn new(dataset: impl Into<String>, source: SourceKey) -> Self {
        Self {
            dataset: dataset.into(),
            source,
            last_sync_at: None,
            cursor: None,
            known_external_ids: BTreeSet::new(),
        }
    }

    pub fn record_id(&self) -> String {
        checkpoint_id(&self.dataset, &self.source)
    }

    fn to_record(&self) -> Record {
        let last_sync_at = self
            .last_sync_at
            .map(|ts| Value::from(ts.to_rfc3339_opts(SecondsFormat::Micros, true)))
            .unwrap_or(Value::Null);
        let cursor = self.cursor.clone().map(Value::from).unwrap_or(Value::Null);
        let known: Vec<Value> = self
            .known_external_ids
            .iter()
            .map(|id| Value::from(id.as_str()))
            .collect();

        Record::new(format!("checkpoint {}", self.source), "")
            .with_id(self.record_id())
            .with_type(RecordType::Checkpoint)
            .with_metadata("dataset", self.dataset.as_str())
            .with_metadata("source_type", self.source.source_type.as_str())
            .with_metadata("source_identity", self.source.source_identity.as_str())
            .with_metadata("last_sync_at", last_sync_at)
            .with_metadata("cursor", cursor)
            .with_metadata("known_external_ids", Value::Array(known))
    }

    fn from_record(record: &Record) -> Result<Self, StoreError> {
        let meta = &record.custom_metadata;
        let field = |key: &str| {
            meta.get_str(key)
                .map(str::to_string)
                .ok_or_else(|| corrupt(record, &format!("missing '{}'", key)))
        };

        let last_sync_at = match meta.get_str("last_sync_at") {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| corrupt(record, &format!("bad last_sync_at: {}", e)))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let known_external_ids = match meta.get("known_external_ids") {
            Some(Value::Array(ids)) => ids
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| corrupt(record, "non-string known_external_ids entry"))
                })
                .collect::<Result<BTreeSet<_>, _>>()?,
            _ => BTreeSet::new(),
        };

        Ok(Self {
            dataset: field("dataset")?,
            source: SourceKey::new(field("source_type")?, field("source_identity")?),
            last_sync_at,
            cursor: meta.get_str("cursor").map(str::to_string),
            known_external_ids,
        })
    }
}

fn corrupt(record: &Record, what: &str) -> StoreError {
    StoreError::Corrupt(format!("checkpoint {}: {}", record.unique_id, what))
}

pub fn checkpoint_id(dataset: &str, key: &SourceKey) -> String {
    format!(
        "checkpoint:{}:{}:{}",
        dataset, key.source_type, key.source_identity
    )
}

/// Checkpoint persistence for one dataset.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn Store>,
    dataset: String,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn Store>, dataset: impl Into<String>) -> Self {
        Self {
            store,
            dataset: dataset.into(),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// The current checkpoint, or `None` for a source never synced (or reset).
    pub async fn load(&self, key: &SourceKey) -> Result<Option<Checkpoint>, StoreError> {
        match self.store.get(&checkpoint_id(&self.dataset, key)).await? {
            Some(record) if !record.is_tombstoned() => Checkpoint::from_record(&record).map(Some),
            _ => Ok(None),
        }
    }

    /// Persist `checkpoint`. `last_sync_at` is kept at the later of the
    /// stored and the given value. Returns what was stored.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<Checkpoint, StoreError> {
        let id = checkpoint.record_id();
        let mut attempt = checkpoint.clone();
        attempt.last_sync_at = attempt.last_sync_at.map(normalize_ts);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let existing = self.store.get(&id).await?;
            let result = match &existing {
                None => self.store.create(&attempt.to_record()).await,
                Some(stored) => {
                    if !stored.is_tombstoned() {
                        let previous = Checkpoint::from_record(stored)?;
                        attempt.last_sync_at = attempt.last_sync_at.max(previous.last_sync_at);
                    }
                    let mut record = attempt.to_record();
                    record.created_at = stored.created_at;
                    record.updated_at = next_ts(stored.updated_at);
                    record.revision = stored.revision;
                    record.status = RecordStatus::Published;
                    self.store.update(&id, &record).await
                }
            };
            match result {
                Ok(_) => {
                    tracing::debug!(
                        checkpoint = %id,
                        cursor = ?attempt.cursor,
                        "checkpoint saved"
                    );
                    return Ok(attempt);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict(id))
    }

    pub async fn list(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let records = self
            .store
            .scan(&RecordFilter::of_type(RecordType::Checkpoint))
            .await?;
        let mut checkpoints = Vec::new();
        for record in &records {
            let checkpoint = Checkpoint::from_record(record)?;
            if checkpoint.dataset == self.dataset {
                checkpoints.push(checkpoint);
            }
        }
        checkpoints.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(checkpoints)
    }

    /// Forget a source's progress so its next run is full. Returns whether
    /// there was anything to forget.
    pub async fn reset(&self, key: &SourceKey) -> Result<bool, StoreError> {
        let id = checkpoint_id(&self.dataset, key);
        match self.store.get(&id).await? {
            Some(record) if !record.is_tombstoned() => {
                self.store.tombstone(&id).await?;
                tracing::info!(checkpoint = %id, "checkpoint reset");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
