//! Source adapter contract and registry.
//!
//! Every integration implements [`SourceAdapter`]: a fixed capability set
//! that the sync engine drives. Adapters are selected by configuration and
//! held as trait objects in an [`AdapterRegistry`].
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             AdapterRegistry              │
//! │  ┌────────────┐ ┌─────────────────────┐  │
//! │  │ filesystem │ │ custom (registered) │  │
//! │  └────────────┘ └─────────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!      SyncEngine::run() → RecordManager
//! ```
//!
//! # Usage
//!
//! ```rust
//! use record_sync::adapter::AdapterRegistry;
//!
//! let mut adapters = AdapterRegistry::new();
//! // adapters.register(Box::new(MyAdapter::new()));
//! assert!(adapters.is_empty());
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{AdapterError, MappingFailure, SyncError};
use crate::models::{Provenance, Record, SourceKey};

/// A unit of data as the source sees it, before mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalItem {
    /// Stable and unique within the source.
    pub external_id: String,
    pub modified_at: DateTime<Utc>,
    /// Resumption token pointing just past this item, if the source has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ExternalItem {
    pub fn new(external_id: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            external_id: external_id.into(),
            modified_at,
            cursor: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Lazy item sequence produced by [`SourceAdapter::discover`].
///
/// An `Err` ends the run: items already committed stay committed, the
/// rest of the current batch is dropped.
pub type ItemStream<'a> = BoxStream<'a, Result<ExternalItem, AdapterError>>;

/// An external source the sync engine can import from.
///
/// # Lifecycle
///
/// 1. The adapter is registered via [`AdapterRegistry::register`].
/// 2. [`authenticate`](SourceAdapter::authenticate) is called once per run.
/// 3. [`discover`](SourceAdapter::discover) is polled in bounded batches;
///    the engine never assumes the whole set is enumerable up front.
/// 4. [`map`](SourceAdapter::map) converts each new or changed item.
///
/// The engine owns provenance, `updated_at`, and `unique_id` of mapped
/// records; whatever `map` puts there is overwritten. A record's
/// `unique_id` is derived from its provenance, so `map` can link to items
/// that have not been synced yet through [`record_id`](SourceAdapter::record_id).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Adapter kind, e.g. `"filesystem"`.
    fn source_type(&self) -> &str;

    /// Configured instance name, e.g. `"notes"`.
    fn source_identity(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn key(&self) -> SourceKey {
        SourceKey::new(self.source_type(), self.source_identity())
    }

    /// The `unique_id` a record synced from `external_id` gets, for edge
    /// targets inside this source.
    fn record_id(&self, external_id: &str) -> String {
        Provenance::new(&self.key(), external_id).unique_id()
    }

    /// `Ok(false)` means the credentials were rejected; `Err` means the
    /// check itself could not be performed.
    async fn authenticate(&self) -> Result<bool, AdapterError>;

    /// Items changed after `cursor`, or every item when `cursor` is `None`.
    fn discover(&self, cursor: Option<String>) -> ItemStream<'_>;

    fn map(&self, item: &ExternalItem) -> Result<Record, MappingFailure>;
}

/// Holds the configured adapters.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// A registry pre-loaded with every adapter instance in the config.
    pub fn from_config(config: &Config) -> Self {
        use crate::source_fs::FilesystemAdapter;

        let mut registry = Self::new();
        for (name, cfg) in &config.sources.filesystem {
            registry.register(Box::new(FilesystemAdapter::new(name.clone(), cfg.clone())));
        }
        registry
    }

    pub fn register(&mut self, adapter: Box<dyn SourceAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn adapters(&self) -> &[Box<dyn SourceAdapter>] {
        &self.adapters
    }

    pub fn find(&self, source_type: &str, source_identity: &str) -> Option<&dyn SourceAdapter> {
        self.adapters
            .iter()
            .find(|a| a.source_type() == source_type && a.source_identity() == source_identity)
            .map(|a| a.as_ref())
    }

    /// Resolve a selector: `all`, a source type, or `type:identity`.
    pub fn resolve(&self, selector: &str) -> Result<Vec<&dyn SourceAdapter>, SyncError> {
        let selected: Vec<&dyn SourceAdapter> = if selector == "all" {
            self.adapters.iter().map(|a| a.as_ref()).collect()
        } else if let Some((source_type, identity)) = selector.split_once(':') {
            self.find(source_type, identity).into_iter().collect()
        } else {
            self.adapters
                .iter()
                .filter(|a| a.source_type() == selector)
                .map(|a| a.as_ref())
                .collect()
        };

        if selected.is_empty() {
            return Err(SyncError::UnknownSource(selector.to_string()));
        }
        Ok(selected)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
