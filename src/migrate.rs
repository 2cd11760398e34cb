use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema on an open pool. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Records table. Checkpoints and sync leases live here too, as
    // reserved record types, so they commit alongside the data.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            unique_id TEXT PRIMARY KEY,
            title TEXT NOT NULL DEFAULT '',
            text_content TEXT NOT NULL DEFAULT '',
            embedding BLOB,
            metadata_json TEXT NOT NULL DEFAULT '[]',
            tags_json TEXT NOT NULL DEFAULT '[]',
            relationships_json TEXT NOT NULL DEFAULT '[]',
            collection TEXT,
            record_type TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            source_type TEXT,
            source_identity TEXT,
            external_id TEXT,
            source_modified_at INTEGER,
            revision INTEGER NOT NULL DEFAULT 1,
            UNIQUE(source_type, source_identity, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before the source clock was tracked.
    let has_source_clock: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('records') WHERE name = 'source_modified_at'",
    )
    .fetch_one(pool)
    .await?;
    if has_source_clock == 0 {
        sqlx::query("ALTER TABLE records ADD COLUMN source_modified_at INTEGER")
            .execute(pool)
            .await?;
    }

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_source ON records(source_type, source_identity)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_type_status ON records(record_type, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_created_at ON records(created_at, unique_id)")
        .execute(pool)
        .await?;

    Ok(())
}
