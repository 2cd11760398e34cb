//! Incremental sync engine.
//!
//! Drives one [`SourceAdapter`] against the record store:
//!
//! ```text
//! Idle → Discovering → Diffing → Applying → Checkpointing ─┐
//!          ▲                                                │
//!          └──────────────── next batch ────────────────────┘
//! ```
//!
//! Items are pulled from the adapter in bounded batches. Each batch is
//! diffed against the provenance index, applied with bounded fan-out, and
//! then the checkpoint is flushed. A run that stops early (adapter error,
//! circuit break, cancellation) leaves the checkpoint at the last committed
//! batch; replaying a batch is safe because upserts are idempotent.
//!
//! Deletion detection only runs at the end of a complete, uncancelled full
//! run, since only such a run has seen the whole external set.
//!
//! The run holds a per-source lease and renews it before every write
//! phase; losing it to another run aborts this one.
//!
//! Only configuration errors and a held lease escape as [`SyncError`];
//! everything else is reported in the [`SyncResult`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;

use crate::adapter::{ExternalItem, SourceAdapter};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{SyncConfig, MAX_LOCK_TTL_SECS};
use crate::embedding::EmbeddingProvider;
use crate::error::{MappingFailure, StoreError, SyncError};
use crate::lock::SyncLease;
use crate::models::{next_ts, normalize_ts, now, Provenance, Record, SourceKey};
use crate::records::{RecordManager, UpsertOutcome};
use crate::store::{RecordFilter, Store};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Ignore the stored cursor and rediscover everything.
    pub full: bool,
    pub detect_deletions: bool,
    pub batch_size: usize,
    /// Concurrent upserts within a batch.
    pub workers: usize,
    pub max_consecutive_failures: usize,
    pub lock_ttl: chrono::Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            full: false,
            detect_deletions: config.detect_deletions,
            batch_size: config.batch_size,
            workers: config.workers,
            max_consecutive_failures: config.max_consecutive_failures,
            lock_ttl: chrono::Duration::seconds(
                config.lock_ttl_secs.min(MAX_LOCK_TTL_SECS) as i64,
            ),
        }
    }
}

impl SyncOptions {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.batch_size == 0 {
            return Err(SyncError::InvalidOptions("batch_size must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(SyncError::InvalidOptions("workers must be > 0".into()));
        }
        if self.max_consecutive_failures == 0 {
            return Err(SyncError::InvalidOptions(
                "max_consecutive_failures must be > 0".into(),
            ));
        }
        if self.lock_ttl <= chrono::Duration::zero() {
            return Err(SyncError::InvalidOptions("lock_ttl must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Discovering,
    Diffing,
    Applying,
    Checkpointing,
    /// The run aborted before any batch was committed.
    Failed,
}

/// One classified item from a diff pass.
#[derive(Debug, Clone)]
pub enum Change {
    Add(ExternalItem),
    /// Newer than the stored record, or a tombstoned record seen again.
    Update {
        item: ExternalItem,
        existing: Record,
    },
    Skip(ExternalItem),
    Delete(Record),
}

/// The classified result of one diff pass.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn adds(&self) -> usize {
        self.count(|c| matches!(c, Change::Add(_)))
    }

    pub fn updates(&self) -> usize {
        self.count(|c| matches!(c, Change::Update { .. }))
    }

    pub fn skips(&self) -> usize {
        self.count(|c| matches!(c, Change::Skip(_)))
    }

    pub fn deletes(&self) -> usize {
        self.count(|c| matches!(c, Change::Delete(_)))
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn count(&self, pred: impl Fn(&Change) -> bool) -> usize {
        self.changes.iter().filter(|c| pred(c)).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemErrorKind {
    Mapping,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemError {
    pub external_id: String,
    pub kind: ItemErrorKind,
    pub message: String,
}

/// Counts consecutive storage failures across a run.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    limit: usize,
    consecutive: usize,
}

impl CircuitBreaker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns `true` once the limit is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.is_tripped()
    }

    pub fn is_tripped(&self) -> bool {
        self.consecutive >= self.limit
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: Vec<ItemError>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub source: String,
    pub success: bool,
    /// Discovery started without a cursor.
    pub full: bool,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
    pub warnings: Vec<String>,
    pub batches_committed: usize,
    pub state: SyncState,
    /// Cursor stored in the checkpoint when the run ended.
    pub cursor: Option<String>,
    pub cancelled: bool,
    /// Why the run stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl SyncResult {
    fn new(key: &SourceKey) -> Self {
        Self {
            source: key.to_string(),
            success: true,
            full: false,
            created: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            batches_committed: 0,
            state: SyncState::Idle,
            cursor: None,
            cancelled: false,
            aborted: None,
        }
    }

    fn absorb(&mut self, report: ApplyReport) {
        self.created += report.created;
        self.updated += report.updated;
        self.skipped += report.skipped;
        self.deleted += report.deleted;
        self.failed += report.errors.len();
        self.errors.extend(report.errors);
        self.warnings.extend(report.warnings);
    }

    fn abort(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(source = %self.source, reason = %reason, "sync aborted");
        self.success = false;
        self.aborted = Some(reason);
    }

    fn finish(mut self) -> Self {
        self.state = if self.aborted.is_some() && self.batches_committed == 0 {
            SyncState::Failed
        } else {
            SyncState::Idle
        };
        self
    }
}

enum ItemOutcome {
    Written(UpsertOutcome),
    Deleted,
    Skipped,
    MappingFailed(MappingFailure),
    StorageFailed {
        external_id: String,
        error: StoreError,
    },
}

struct Applied {
    outcome: ItemOutcome,
    warning: Option<String>,
}

impl From<ItemOutcome> for Applied {
    fn from(outcome: ItemOutcome) -> Self {
        Self {
            outcome,
            warning: None,
        }
    }
}

/// Collapse repeated external ids to the newest `modified_at`.
fn dedupe(items: Vec<ExternalItem>) -> Vec<ExternalItem> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<ExternalItem> = Vec::with_capacity(items.len());
    for item in items {
        match index.get(&item.external_id) {
            Some(&i) => {
                if item.modified_at >= out[i].modified_at {
                    out[i] = item;
                }
            }
            None => {
                index.insert(item.external_id.clone(), out.len());
                out.push(item);
            }
        }
    }
    out
}

/// The source's modification time of the stored version. Records written
/// before the source clock was tracked fall back to `updated_at`.
fn source_clock(record: &Record) -> DateTime<Utc> {
    record
        .provenance
        .as_ref()
        .and_then(|p| p.source_modified_at)
        .unwrap_or(record.updated_at)
}

fn external_id_of(record: &Record) -> String {
    record
        .provenance
        .as_ref()
        .map(|p| p.external_id.clone())
        .unwrap_or_else(|| record.unique_id.clone())
}

/// Renew the lease before writing. A lost lease aborts the run.
async fn keep_lease(lease: &SyncLease, result: &mut SyncResult) -> bool {
    match lease.renew().await {
        Ok(true) => true,
        Ok(false) => {
            result.abort("sync lease lost to another run");
            false
        }
        Err(e) => {
            result.abort(format!("sync lease renewal failed: {}", e));
            false
        }
    }
}

pub struct SyncEngine {
    records: RecordManager,
    checkpoints: CheckpointStore,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn Store>, dataset: impl Into<String>) -> Self {
        Self {
            records: RecordManager::new(store.clone()),
            checkpoints: CheckpointStore::new(store, dataset),
            embedder: None,
        }
    }

    /// Embed mapped records on the way in. Failures become warnings.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn records(&self) -> &RecordManager {
        &self.records
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub async fn run(
        &self,
        adapter: &dyn SourceAdapter,
        opts: &SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_with_cancel(adapter, opts, cancel_rx).await
    }

    /// Like [`run`](Self::run), stopping between batches once `cancel`
    /// reads `true`.
    pub async fn run_with_cancel(
        &self,
        adapter: &dyn SourceAdapter,
        opts: &SyncOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<SyncResult, SyncError> {
        opts.validate()?;
        let key = adapter.key();

        let lease = SyncLease::acquire(
            self.records.store().clone(),
            self.checkpoints.dataset(),
            &key,
            opts.lock_ttl,
        )
        .await?
        .ok_or_else(|| SyncError::AlreadyRunning(key.to_string()))?;

        let result = self.run_locked(adapter, &key, opts, &cancel, &lease).await;

        if let Err(e) = lease.release().await {
            tracing::warn!(source = %key, error = %e, "failed to release sync lease");
        }
        result
    }

    async fn run_locked(
        &self,
        adapter: &dyn SourceAdapter,
        key: &SourceKey,
        opts: &SyncOptions,
        cancel: &watch::Receiver<bool>,
        lease: &SyncLease,
    ) -> Result<SyncResult, SyncError> {
        let mut result = SyncResult::new(key);
        let mut checkpoint = self
            .checkpoints
            .load(key)
            .await?
            .unwrap_or_else(|| Checkpoint::new(self.checkpoints.dataset(), key.clone()));

        let start_cursor = if opts.full {
            None
        } else {
            checkpoint.cursor.clone()
        };
        result.full = start_cursor.is_none();
        result.cursor = checkpoint.cursor.clone();
        tracing::info!(source = %key, full = result.full, "sync started");

        result.state = SyncState::Discovering;
        match adapter.authenticate().await {
            Ok(true) => {}
            Ok(false) => {
                result.abort("authentication rejected");
                return Ok(result.finish());
            }
            Err(e) => {
                result.abort(format!("authentication failed: {}", e));
                return Ok(result.finish());
            }
        }

        let mut stream = adapter.discover(start_cursor);
        let mut breaker = CircuitBreaker::new(opts.max_consecutive_failures);
        let mut observed: BTreeSet<String> = BTreeSet::new();
        let mut completed = false;

        loop {
            if *cancel.borrow() {
                result.cancelled = true;
                result.warnings.push(format!(
                    "cancelled after {} committed batches",
                    result.batches_committed
                ));
                tracing::info!(source = %key, "sync cancelled");
                break;
            }

            result.state = SyncState::Discovering;
            let mut batch = Vec::with_capacity(opts.batch_size);
            let mut adapter_error = None;
            while batch.len() < opts.batch_size {
                match stream.next().await {
                    Some(Ok(item)) => batch.push(item),
                    Some(Err(e)) => {
                        adapter_error = Some(e);
                        break;
                    }
                    None => {
                        completed = true;
                        break;
                    }
                }
            }
            if let Some(e) = adapter_error {
                // The partial batch is dropped; the checkpoint stays put.
                result.abort(format!("adapter error: {}", e));
                break;
            }
            if batch.is_empty() {
                break;
            }

            let batch_cursor = batch.iter().rev().find_map(|i| i.cursor.clone());
            observed.extend(batch.iter().map(|i| i.external_id.clone()));

            result.state = SyncState::Diffing;
            let changes = match self.diff(key, batch).await {
                Ok(changes) => changes,
                Err(e) => {
                    result.abort(format!("diff failed: {}", e));
                    break;
                }
            };
            tracing::debug!(
                source = %key,
                adds = changes.adds(),
                updates = changes.updates(),
                skips = changes.skips(),
                "batch diffed"
            );

            if !keep_lease(lease, &mut result).await {
                break;
            }
            result.state = SyncState::Applying;
            let report = self.apply(adapter, changes, opts, &mut breaker).await;
            result.absorb(report);
            if breaker.is_tripped() {
                result.abort(format!(
                    "circuit breaker tripped after {} consecutive storage failures",
                    opts.max_consecutive_failures
                ));
                break;
            }

            result.state = SyncState::Checkpointing;
            if !keep_lease(lease, &mut result).await {
                break;
            }
            if batch_cursor.is_some() {
                checkpoint.cursor = batch_cursor;
            }
            checkpoint.last_sync_at = Some(now());
            match self.checkpoints.save(&checkpoint).await {
                Ok(saved) => {
                    checkpoint = saved;
                    result.batches_committed += 1;
                    result.cursor = checkpoint.cursor.clone();
                }
                Err(e) => {
                    result.abort(format!("checkpoint save failed: {}", e));
                    break;
                }
            }

            if completed {
                break;
            }
        }

        let may_delete = opts.detect_deletions
            && result.full
            && completed
            && !result.cancelled
            && result.aborted.is_none();
        if may_delete {
            self.detect_deletions(
                adapter,
                key,
                opts,
                lease,
                &mut breaker,
                &mut checkpoint,
                observed,
                &mut result,
            )
            .await;
        } else if opts.detect_deletions && !result.full {
            tracing::debug!(source = %key, "incremental run, deletion detection skipped");
        }

        tracing::info!(
            source = %key,
            success = result.success,
            created = result.created,
            updated = result.updated,
            deleted = result.deleted,
            skipped = result.skipped,
            failed = result.failed,
            "sync finished"
        );
        Ok(result.finish())
    }

    #[allow(clippy::too_many_arguments)]
    async fn detect_deletions(
        &self,
        adapter: &dyn SourceAdapter,
        key: &SourceKey,
        opts: &SyncOptions,
        lease: &SyncLease,
        breaker: &mut CircuitBreaker,
        checkpoint: &mut Checkpoint,
        observed: BTreeSet<String>,
        result: &mut SyncResult,
    ) {
        result.state = SyncState::Diffing;
        let live = match self
            .records
            .store()
            .scan(&RecordFilter::for_source(key))
            .await
        {
            Ok(live) => live,
            Err(e) => {
                result.abort(format!("deletion scan failed: {}", e));
                return;
            }
        };

        let gone: HashSet<String> = checkpoint
            .known_external_ids
            .iter()
            .cloned()
            .chain(live.iter().map(external_id_of))
            .filter(|id| !observed.contains(id))
            .collect();
        let changes = ChangeSet {
            changes: live
                .into_iter()
                .filter(|r| gone.contains(&external_id_of(r)))
                .map(Change::Delete)
                .collect(),
        };

        if !keep_lease(lease, result).await {
            return;
        }
        result.state = SyncState::Applying;
        let report = self.apply(adapter, changes, opts, breaker).await;
        result.absorb(report);
        if breaker.is_tripped() {
            result.abort(format!(
                "circuit breaker tripped after {} consecutive storage failures",
                opts.max_consecutive_failures
            ));
            return;
        }

        result.state = SyncState::Checkpointing;
        if !keep_lease(lease, result).await {
            return;
        }
        checkpoint.known_external_ids = observed;
        checkpoint.last_sync_at = Some(now());
        match self.checkpoints.save(checkpoint).await {
            Ok(saved) => *checkpoint = saved,
            Err(e) => result.abort(format!("checkpoint save failed: {}", e)),
        }
    }

    /// Classify a batch against the provenance index.
    pub async fn diff(
        &self,
        key: &SourceKey,
        items: Vec<ExternalItem>,
    ) -> Result<ChangeSet, StoreError> {
        let mut changes = Vec::with_capacity(items.len());
        for item in dedupe(items) {
            let provenance = Provenance::new(key, &item.external_id);
            let change = match self.records.find_by_source(&provenance).await? {
                None => Change::Add(item),
                Some(existing) if existing.is_tombstoned() => Change::Update { item, existing },
                Some(existing) if normalize_ts(item.modified_at) > source_clock(&existing) => {
                    Change::Update { item, existing }
                }
                Some(_) => Change::Skip(item),
            };
            changes.push(change);
        }
        Ok(ChangeSet { changes })
    }

    /// Apply a change set with up to `opts.workers` writes in flight.
    ///
    /// Outcomes are consumed in change order. Processing stops as soon as
    /// `breaker` trips.
    pub async fn apply(
        &self,
        adapter: &dyn SourceAdapter,
        changes: ChangeSet,
        opts: &SyncOptions,
        breaker: &mut CircuitBreaker,
    ) -> ApplyReport {
        let key = adapter.key();
        let key = &key;
        let mut outcomes = futures::stream::iter(changes.changes)
            .map(move |change| self.apply_change(adapter, key, change))
            .buffered(opts.workers.max(1));

        let mut report = ApplyReport::default();
        while let Some(applied) = outcomes.next().await {
            if let Some(warning) = applied.warning {
                report.warnings.push(warning);
            }
            match applied.outcome {
                ItemOutcome::Written(outcome) => {
                    breaker.record_success();
                    match outcome {
                        UpsertOutcome::Created(_) => report.created += 1,
                        UpsertOutcome::Updated(_) => report.updated += 1,
                        UpsertOutcome::Unchanged(_) | UpsertOutcome::Stale(_) => {
                            report.skipped += 1
                        }
                    }
                }
                ItemOutcome::Deleted => {
                    breaker.record_success();
                    report.deleted += 1;
                }
                ItemOutcome::Skipped => report.skipped += 1,
                ItemOutcome::MappingFailed(failure) => {
                    tracing::warn!(
                        source = %key,
                        external_id = %failure.external_id,
                        reason = %failure.reason,
                        "mapping failed"
                    );
                    report.errors.push(ItemError {
                        external_id: failure.external_id,
                        kind: ItemErrorKind::Mapping,
                        message: failure.reason,
                    });
                }
                ItemOutcome::StorageFailed { external_id, error } => {
                    tracing::warn!(
                        source = %key,
                        external_id = %external_id,
                        error = %error,
                        "storage write failed"
                    );
                    report.errors.push(ItemError {
                        external_id,
                        kind: ItemErrorKind::Storage,
                        message: error.to_string(),
                    });
                    if breaker.record_failure() {
                        break;
                    }
                }
            }
        }
        report
    }

    async fn apply_change(
        &self,
        adapter: &dyn SourceAdapter,
        key: &SourceKey,
        change: Change,
    ) -> Applied {
        match change {
            Change::Skip(_) => ItemOutcome::Skipped.into(),
            Change::Delete(record) => match self.records.tombstone(&record.unique_id).await {
                Ok(_) => ItemOutcome::Deleted.into(),
                Err(error) => ItemOutcome::StorageFailed {
                    external_id: external_id_of(&record),
                    error,
                }
                .into(),
            },
            Change::Add(item) => self.write_item(adapter, key, item, None).await,
            Change::Update { item, existing } => {
                self.write_item(adapter, key, item, Some(existing)).await
            }
        }
    }

    async fn write_item(
        &self,
        adapter: &dyn SourceAdapter,
        key: &SourceKey,
        item: ExternalItem,
        existing: Option<Record>,
    ) -> Applied {
        let mut record = match adapter.map(&item) {
            Ok(record) => record,
            Err(failure) => return ItemOutcome::MappingFailed(failure).into(),
        };

        let source_ts = normalize_ts(item.modified_at);
        let provenance =
            Provenance::new(key, &item.external_id).with_source_modified_at(source_ts);
        record.updated_at = source_ts;
        match &existing {
            Some(existing) => {
                record.unique_id = existing.unique_id.clone();
                // Collection membership is local state the source knows nothing about.
                if record.member_of_edge().is_none() {
                    if let Some(edge) = existing.member_of_edge() {
                        record.relationships.push(edge.clone());
                    }
                }
                // Local edits and tombstones may have moved the stored clock
                // past the source's; the newer source version still wins.
                if record.updated_at <= existing.updated_at {
                    record.updated_at = next_ts(existing.updated_at);
                }
            }
            None => record.unique_id = provenance.unique_id(),
        }
        record.provenance = Some(provenance);

        let warning = self
            .embed_into(&mut record, &item.external_id, existing.as_ref())
            .await;

        let outcome = match self.records.upsert(record).await {
            Ok(outcome) => ItemOutcome::Written(outcome),
            Err(error) => ItemOutcome::StorageFailed {
                external_id: item.external_id,
                error,
            },
        };
        Applied { outcome, warning }
    }

    async fn embed_into(
        &self,
        record: &mut Record,
        external_id: &str,
        existing: Option<&Record>,
    ) -> Option<String> {
        let embedder = self.embedder.as_ref()?;
        if record.embedding.is_some() {
            return None;
        }
        if let Some(existing) = existing {
            // The stored vector is carried over on upsert.
            if existing.embedding.is_some() && existing.text_content == record.text_content {
                return None;
            }
        }
        match embedder.embed(&record.text_content).await {
            Ok(vector) => {
                record.embedding = Some(vector);
                None
            }
            Err(e) => {
                tracing::warn!(external_id, error = %e, "embedding failed, record stored without one");
                Some(format!("embedding failed for '{}': {}", external_id, e))
            }
        }
    }
}
