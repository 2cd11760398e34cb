//! Embedding backfill.
//!
//! Records stored without a vector (embedding disabled at sync time, or a
//! provider failure) are picked up here. The vector is written without
//! advancing `updated_at`, so later sync diffs are unaffected.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::StoreError;
use crate::store::{RecordFilter, Store};

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillStats {
    pub pending: usize,
    pub embedded: usize,
    pub failed: usize,
}

/// Embed up to `limit` live records that have no vector.
pub async fn embed_pending(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    limit: Option<usize>,
    batch_size: usize,
) -> Result<BackfillStats> {
    let filter = RecordFilter {
        missing_embedding: true,
        limit,
        ..Default::default()
    };
    let pending = store.scan(&filter).await?;
    let mut stats = BackfillStats {
        pending: pending.len(),
        ..Default::default()
    };

    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|r| r.text_content.clone()).collect();
        let vectors = match provider.embed_batch(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                tracing::warn!(error = %e, records = batch.len(), "embedding batch failed");
                stats.failed += batch.len();
                continue;
            }
        };

        for (record, vector) in batch.iter().zip(vectors) {
            let mut updated = record.clone();
            updated.embedding = Some(vector);
            match store.update(&record.unique_id, &updated).await {
                Ok(_) => stats.embedded += 1,
                // Changed since the scan; the next backfill sees the new version.
                Err(StoreError::Conflict(_)) => stats.failed += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(stats)
}

pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let store = db::open_store(config).await?;

    if dry_run {
        let filter = RecordFilter {
            missing_embedding: true,
            limit,
            ..Default::default()
        };
        let pending = store.scan(&filter).await?;
        println!("embed pending (dry-run)");
        println!("  records needing embeddings: {}", pending.len());
        store.pool().close().await;
        return Ok(());
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let stats = embed_pending(store.as_ref(), provider.as_ref(), limit, batch_size).await?;

    println!("embed pending");
    if stats.pending == 0 {
        println!("  all records up to date");
    } else {
        println!("  total pending: {}", stats.pending);
        println!("  embedded: {}", stats.embedded);
        println!("  failed: {}", stats.failed);
    }

    store.pool().close().await;
    Ok(())
}
