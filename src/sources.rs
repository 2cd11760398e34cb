//! Source listing and checkpoint inspection.

use anyhow::Result;
use chrono::SecondsFormat;

use crate::adapter::AdapterRegistry;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::Config;
use crate::db;
use crate::get::parse_source;

fn last_sync(checkpoint: Option<&Checkpoint>) -> String {
    checkpoint
        .and_then(|c| c.last_sync_at)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "never".to_string())
}

pub async fn list_sources(config: &Config) -> Result<()> {
    let registry = AdapterRegistry::from_config(config);
    if registry.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    let store = db::open_store(config).await?;
    let checkpoints = CheckpointStore::new(store.clone(), config.sync.dataset.clone());

    println!("{:<28} {:<10} {:<22} DESCRIPTION", "SOURCE", "STATUS", "LAST SYNC");
    for adapter in registry.adapters() {
        let status = match adapter.authenticate().await {
            Ok(true) => "OK",
            Ok(false) => "DENIED",
            Err(e) => {
                tracing::warn!(source = %adapter.key(), error = %e, "health check failed");
                "ERROR"
            }
        };
        let checkpoint = checkpoints.load(&adapter.key()).await?;
        println!(
            "{:<28} {:<10} {:<22} {}",
            adapter.key().to_string(),
            status,
            last_sync(checkpoint.as_ref()),
            adapter.description()
        );
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_checkpoint_show(config: &Config, source: &str) -> Result<()> {
    let key = parse_source(source)?;
    let store = db::open_store(config).await?;
    let checkpoints = CheckpointStore::new(store.clone(), config.sync.dataset.clone());

    match checkpoints.load(&key).await? {
        Some(checkpoint) => {
            println!("checkpoint {}", checkpoint.source);
            println!("  dataset: {}", checkpoint.dataset);
            println!("  last sync: {}", last_sync(Some(&checkpoint)));
            println!(
                "  cursor: {}",
                checkpoint.cursor.as_deref().unwrap_or("(none)")
            );
            println!("  known ids: {}", checkpoint.known_external_ids.len());
        }
        None => println!("no checkpoint for {}", key),
    }

    store.pool().close().await;
    Ok(())
}

/// Drop the checkpoint so the next sync starts from scratch. Synced records
/// are kept.
pub async fn run_checkpoint_reset(config: &Config, source: &str) -> Result<()> {
    let key = parse_source(source)?;
    let store = db::open_store(config).await?;
    let checkpoints = CheckpointStore::new(store.clone(), config.sync.dataset.clone());

    if checkpoints.reset(&key).await? {
        println!("checkpoint reset for {}", key);
    } else {
        println!("no checkpoint for {}", key);
    }

    store.pool().close().await;
    Ok(())
}
