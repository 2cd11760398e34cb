//! Sync command orchestration.
//!
//! Resolves the selected sources from config, runs the sync engine for each
//! one in turn, and prints a per-source summary (or JSON with `--json`).
//! Ctrl-C requests cancellation; the engine stops at the next batch
//! boundary with the checkpoint intact.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::watch;

use crate::adapter::AdapterRegistry;
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::engine::{SyncEngine, SyncOptions, SyncResult};

/// Command-line overrides on top of `[sync]` config.
#[derive(Debug, Clone, Default)]
pub struct SyncOverrides {
    pub full: bool,
    pub detect_deletions: bool,
    pub batch_size: Option<usize>,
}

pub fn sync_options(config: &Config, overrides: &SyncOverrides) -> SyncOptions {
    let mut opts = SyncOptions::from(&config.sync);
    opts.full = overrides.full;
    opts.detect_deletions = opts.detect_deletions || overrides.detect_deletions;
    if let Some(batch_size) = overrides.batch_size {
        opts.batch_size = batch_size;
    }
    opts
}

pub async fn run_sync(
    config: &Config,
    selector: &str,
    overrides: SyncOverrides,
    json: bool,
) -> Result<()> {
    let registry = AdapterRegistry::from_config(config);
    let adapters = registry.resolve(selector)?;
    let opts = sync_options(config, &overrides);

    let store = db::open_store(config).await?;
    let mut engine = SyncEngine::new(store.clone(), config.sync.dataset.clone());
    if config.embedding.is_enabled() {
        let provider = embedding::create_provider(&config.embedding)?;
        engine = engine.with_embedder(Arc::from(provider));
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after the current batch");
            let _ = cancel_tx.send(true);
        }
    });

    let mut results: Vec<SyncResult> = Vec::with_capacity(adapters.len());
    for adapter in adapters {
        let result = engine
            .run_with_cancel(adapter, &opts, cancel_rx.clone())
            .await?;
        if !json {
            print_result(&result);
        }
        let stop = result.cancelled;
        results.push(result);
        if stop {
            break;
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }

    store.pool().close().await;

    let failed: Vec<&str> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| r.source.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("sync failed for: {}", failed.join(", "));
    }
    Ok(())
}

fn print_result(result: &SyncResult) {
    println!("sync {}{}", result.source, if result.full { " (full)" } else { "" });
    println!("  created: {}", result.created);
    println!("  updated: {}", result.updated);
    println!("  deleted: {}", result.deleted);
    println!("  skipped: {}", result.skipped);
    println!("  failed: {}", result.failed);
    println!("  batches committed: {}", result.batches_committed);
    if let Some(cursor) = &result.cursor {
        println!("  cursor: {}", cursor);
    }
    for error in &result.errors {
        println!("  error [{:?}] {}: {}", error.kind, error.external_id, error.message);
    }
    for warning in &result.warnings {
        println!("  warning: {}", warning);
    }
    match (&result.aborted, result.cancelled) {
        (Some(reason), _) => println!("aborted: {}", reason),
        (None, true) => println!("cancelled"),
        (None, false) => println!("ok"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_on_top_of_config() {
        let config: Config = toml::from_str(
            r#"
[db]
path = "x.sqlite"

[sync]
batch_size = 50
detect_deletions = true
"#,
        )
        .unwrap();

        let opts = sync_options(&config, &SyncOverrides::default());
        assert_eq!(opts.batch_size, 50);
        assert!(opts.detect_deletions);
        assert!(!opts.full);

        let opts = sync_options(
            &config,
            &SyncOverrides {
                full: true,
                detect_deletions: false,
                batch_size: Some(5),
            },
        );
        assert_eq!(opts.batch_size, 5);
        assert!(opts.full);
        assert!(opts.detect_deletions);
    }
}
