//! SQLite-backed [`Store`] implementation.
//!
//! One `records` table (see [`migrate`](crate::migrate)). Metadata is stored
//! as a JSON array of `[key, value]` pairs, tags and relationships as JSON
//! arrays, embeddings as little-endian f32 BLOBs, and timestamps as integer
//! microseconds since the epoch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::StoreError;
use crate::metadata::Metadata;
use crate::models::{now, Provenance, Record, ScoredRecord};

use super::{RecordFilter, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts_to_db(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn ts_from_db(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", micros)))
}

fn write_err(e: sqlx::Error, unique_id: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(unique_id.to_string())
        }
        _ => StoreError::from(e),
    }
}

fn row_to_record(row: &SqliteRow) -> Result<Record, StoreError> {
    let record_type: String = row.try_get("record_type")?;
    let status: String = row.try_get("status")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let tags_json: String = row.try_get("tags_json")?;
    let relationships_json: String = row.try_get("relationships_json")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    let source_type: Option<String> = row.try_get("source_type")?;
    let source_identity: Option<String> = row.try_get("source_identity")?;
    let external_id: Option<String> = row.try_get("external_id")?;
    let source_modified_at: Option<i64> = row.try_get("source_modified_at")?;
    let revision: i64 = row.try_get("revision")?;

    let mut record = Record::new(
        row.try_get::<String, _>("title")?,
        row.try_get::<String, _>("text_content")?,
    );
    record.unique_id = row.try_get("unique_id")?;
    record.embedding = embedding.map(|blob| blob_to_vec(&blob));
    record.custom_metadata = serde_json::from_str::<Metadata>(&metadata_json)?;
    record.tags = serde_json::from_str(&tags_json)?;
    record.relationships = serde_json::from_str(&relationships_json)?;
    record.record_type = record_type.parse().map_err(StoreError::Corrupt)?;
    record.status = status.parse().map_err(StoreError::Corrupt)?;
    record.created_at = ts_from_db(row.try_get("created_at")?)?;
    record.updated_at = ts_from_db(row.try_get("updated_at")?)?;
    record.provenance = match (source_type, source_identity, external_id) {
        (Some(source_type), Some(source_identity), Some(external_id)) => Some(Provenance {
            source_type,
            source_identity,
            external_id,
            source_modified_at: source_modified_at.map(ts_from_db).transpose()?,
        }),
        _ => None,
    };
    record.revision = revision as u64;
    record.refresh_collection();
    Ok(record)
}

/// Column values shared by INSERT and UPDATE.
struct Columns {
    embedding: Option<Vec<u8>>,
    metadata_json: String,
    tags_json: String,
    relationships_json: String,
    source_type: Option<String>,
    source_identity: Option<String>,
    external_id: Option<String>,
    source_modified_at: Option<i64>,
}

impl Columns {
    fn from_record(record: &Record) -> Result<Self, StoreError> {
        Ok(Self {
            embedding: record.embedding.as_deref().map(vec_to_blob),
            metadata_json: serde_json::to_string(&record.custom_metadata)?,
            tags_json: serde_json::to_string(&record.tags)?,
            relationships_json: serde_json::to_string(&record.relationships)?,
            source_type: record.provenance.as_ref().map(|p| p.source_type.clone()),
            source_identity: record.provenance.as_ref().map(|p| p.source_identity.clone()),
            external_id: record.provenance.as_ref().map(|p| p.external_id.clone()),
            source_modified_at: record
                .provenance
                .as_ref()
                .and_then(|p| p.source_modified_at)
                .map(ts_to_db),
        })
    }
}

fn build_scan<'a>(filter: &'a RecordFilter, embedded_only: bool) -> QueryBuilder<'a, Sqlite> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM records WHERE 1 = 1");

    if !filter.include_deleted {
        qb.push(" AND status != 'deleted'");
    }
    match &filter.record_type {
        Some(t) => {
            qb.push(" AND record_type = ").push_bind(t.as_str());
        }
        None => {
            qb.push(" AND record_type NOT IN ('checkpoint', 'sync_lock')");
        }
    }
    if let Some(key) = &filter.source {
        qb.push(" AND source_type = ")
            .push_bind(key.source_type.as_str())
            .push(" AND source_identity = ")
            .push_bind(key.source_identity.as_str());
    }
    if let Some(ext) = &filter.external_id {
        qb.push(" AND external_id = ").push_bind(ext.as_str());
    }
    if let Some(collection) = &filter.collection {
        qb.push(" AND collection = ").push_bind(collection.as_str());
    }
    if let Some(tag) = &filter.tag {
        qb.push(" AND EXISTS (SELECT 1 FROM json_each(records.tags_json) WHERE json_each.value = ")
            .push_bind(tag.as_str())
            .push(")");
    }
    if filter.missing_embedding {
        qb.push(" AND embedding IS NULL");
    }
    if embedded_only {
        qb.push(" AND embedding IS NOT NULL");
    }

    qb.push(" ORDER BY created_at ASC, unique_id ASC");
    if !embedded_only {
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
    }
    qb
}

#[async_trait]
impl Store for SqliteStore {
    async fn create(&self, record: &Record) -> Result<Record, StoreError> {
        let cols = Columns::from_record(record)?;

        sqlx::query(
            r#"
            INSERT INTO records (unique_id, title, text_content, embedding, metadata_json,
                                 tags_json, relationships_json, collection, record_type, status,
                                 created_at, updated_at, source_type, source_identity,
                                 external_id, source_modified_at, revision)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&record.unique_id)
        .bind(&record.title)
        .bind(&record.text_content)
        .bind(&cols.embedding)
        .bind(&cols.metadata_json)
        .bind(&cols.tags_json)
        .bind(&cols.relationships_json)
        .bind(record.collection())
        .bind(record.record_type.as_str())
        .bind(record.status.as_str())
        .bind(ts_to_db(record.created_at))
        .bind(ts_to_db(record.updated_at))
        .bind(&cols.source_type)
        .bind(&cols.source_identity)
        .bind(&cols.external_id)
        .bind(cols.source_modified_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(e, &record.unique_id))?;

        let mut stored = record.clone();
        stored.revision = 1;
        Ok(stored)
    }

    async fn update(&self, unique_id: &str, record: &Record) -> Result<Record, StoreError> {
        let cols = Columns::from_record(record)?;

        let result = sqlx::query(
            r#"
            UPDATE records SET
                title = ?,
                text_content = ?,
                embedding = ?,
                metadata_json = ?,
                tags_json = ?,
                relationships_json = ?,
                collection = ?,
                record_type = ?,
                status = ?,
                created_at = ?,
                updated_at = ?,
                source_type = ?,
                source_identity = ?,
                external_id = ?,
                source_modified_at = ?,
                revision = revision + 1
            WHERE unique_id = ? AND revision = ?
            "#,
        )
        .bind(&record.title)
        .bind(&record.text_content)
        .bind(&cols.embedding)
        .bind(&cols.metadata_json)
        .bind(&cols.tags_json)
        .bind(&cols.relationships_json)
        .bind(record.collection())
        .bind(record.record_type.as_str())
        .bind(record.status.as_str())
        .bind(ts_to_db(record.created_at))
        .bind(ts_to_db(record.updated_at))
        .bind(&cols.source_type)
        .bind(&cols.source_identity)
        .bind(&cols.external_id)
        .bind(cols.source_modified_at)
        .bind(unique_id)
        .bind(record.revision as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(e, unique_id))?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT revision FROM records WHERE unique_id = ?")
                    .bind(unique_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match exists {
                Some(_) => StoreError::Conflict(unique_id.to_string()),
                None => StoreError::NotFound(unique_id.to_string()),
            });
        }

        let mut stored = record.clone();
        stored.unique_id = unique_id.to_string();
        stored.revision = record.revision + 1;
        Ok(stored)
    }

    async fn tombstone(&self, unique_id: &str) -> Result<Record, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE records SET
                status = 'deleted',
                updated_at = MAX(updated_at + 1, ?),
                revision = revision + 1
            WHERE unique_id = ?
            "#,
        )
        .bind(ts_to_db(now()))
        .bind(unique_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(unique_id.to_string()));
        }
        self.get(unique_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(unique_id.to_string()))
    }

    async fn get(&self, unique_id: &str) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query("SELECT * FROM records WHERE unique_id = ?")
            .bind(unique_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn scan(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let mut qb = build_scan(filter, false);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let mut qb = build_scan(filter, true);
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut candidates: Vec<ScoredRecord> = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
            let score = record
                .embedding
                .as_deref()
                .map(|e| cosine_similarity(query, e))
                .unwrap_or(0.0);
            candidates.push(ScoredRecord { record, score });
        }

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
    use crate::db;
    use crate::migrate;
    use crate::models::{Relationship, RelationshipType, SourceKey};
    use tempfile::TempDir;

    async fn test_store(tmp: &TempDir) -> SqliteStore {
        let pool = db::connect_path(&tmp.path().join("records.sqlite"))
            .await
            .unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_record() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;

        let key = SourceKey::new("filesystem", "notes");
        let mut record = Record::new("Title", "Body text")
            .with_id("r1")
            .with_tag("b")
            .with_tag("a")
            .with_metadata("zeta", 1)
            .with_metadata("alpha", serde_json::json!({"k": [1, 2]}))
            .with_relationship(Relationship::new("r0", RelationshipType::Reference))
            .with_relationship(Relationship::member_of("h1", Some(3)))
            .with_embedding(vec![0.5, -1.25]);
        record.provenance =
            Some(Provenance::new(&key, "a.md").with_source_modified_at(now()));

        store.create(&record).await.unwrap();
        let loaded = store.get("r1").await.unwrap().unwrap();

        assert_eq!(loaded.title, "Title");
        assert_eq!(loaded.custom_metadata.keys().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
        assert_eq!(loaded.relationships, record.relationships);
        assert_eq!(loaded.collection(), Some("h1"));
        assert_eq!(loaded.embedding, Some(vec![0.5, -1.25]));
        assert_eq!(loaded.updated_at, record.updated_at);
        assert_eq!(loaded.provenance, record.provenance);
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.content_hash(), record.content_hash());
    }

    #[tokio::test]
    async fn test_update_conflict_and_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;

        let stored = store.create(&Record::new("t", "x").with_id("r1")).await.unwrap();
        let mut stale = stored.clone();
        stale.revision = 5;
        assert!(matches!(
            store.update("r1", &stale).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            store.update("missing", &stored).await.unwrap_err(),
            StoreError::NotFound(_)
        ));

        let updated = store.update("r1", &stored).await.unwrap();
        assert_eq!(updated.revision, 2);
    }

    #[tokio::test]
    async fn test_scan_filters() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;

        store
            .create(&Record::new("a", "").with_id("a").with_tag("red"))
            .await
            .unwrap();
        store
            .create(
                &Record::new("b", "")
                    .with_id("b")
                    .with_relationship(Relationship::member_of("h", None)),
            )
            .await
            .unwrap();
        store.create(&Record::new("c", "").with_id("c")).await.unwrap();
        store.tombstone("c").await.unwrap();

        let red = store
            .scan(&RecordFilter {
                tag: Some("red".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(red.len(), 1);
        assert_eq!(red[0].unique_id, "a");

        let members = store.scan(&RecordFilter::for_collection("h")).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].unique_id, "b");

        assert_eq!(store.scan(&RecordFilter::default()).await.unwrap().len(), 2);
        let deleted = store.get("c").await.unwrap().unwrap();
        assert!(deleted.is_tombstoned());
    }
}
