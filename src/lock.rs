//! Single-flight sync leases.
//!
//! A lease is a reserved `sync_lock` record keyed by dataset and source.
//! Whoever creates it, or takes it over once released or expired, holds it.
//! The store's revision check decides races between processes.
//!
//! A holder keeps the lease alive with [`SyncLease::renew`] and gives it
//! back with [`SyncLease::release`]. One left behind by a crashed process
//! blocks new runs until it is older than the configured TTL.

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{next_ts, now, Record, RecordStatus, RecordType, SourceKey};
use crate::records::MAX_WRITE_ATTEMPTS;
use crate::store::Store;

pub fn lease_id(dataset: &str, key: &SourceKey) -> String {
    format!(
        "sync_lock:{}:{}:{}",
        dataset, key.source_type, key.source_identity
    )
}

fn holder_of(record: &Record) -> Option<&str> {
    record.custom_metadata.get_str("holder")
}

pub struct SyncLease {
    store: Arc<dyn Store>,
    id: String,
    holder: String,
}

impl SyncLease {
    /// Try to take the lease. `Ok(None)` means another run holds it.
    pub async fn acquire(
        store: Arc<dyn Store>,
        dataset: &str,
        key: &SourceKey,
        ttl: Duration,
    ) -> Result<Option<SyncLease>, StoreError> {
        let id = lease_id(dataset, key);
        let holder = Uuid::new_v4().to_string();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let result = match store.get(&id).await? {
                None => {
                    let record = Record::new(format!("sync lock {}", key), "")
                        .with_id(&id)
                        .with_type(RecordType::SyncLock)
                        .with_metadata("holder", holder.as_str());
                    store.create(&record).await
                }
                Some(existing) => {
                    let held = existing.status == RecordStatus::Published;
                    if held && existing.updated_at + ttl > now() {
                        tracing::debug!(lease = %id, holder = ?holder_of(&existing), "lease busy");
                        return Ok(None);
                    }
                    if held {
                        tracing::warn!(lease = %id, "taking over expired sync lease");
                    }
                    let mut record = existing.clone();
                    record.status = RecordStatus::Published;
                    record.updated_at = next_ts(existing.updated_at);
                    record.custom_metadata.insert("holder", holder.as_str());
                    store.update(&id, &record).await
                }
            };
            match result {
                Ok(_) => {
                    tracing::debug!(lease = %id, "lease acquired");
                    return Ok(Some(SyncLease {
                        store,
                        id,
                        holder,
                    }));
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Push the expiry out by another TTL. `Ok(false)` means the lease was
    /// released or taken over and this holder must stop writing.
    pub async fn renew(&self) -> Result<bool, StoreError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(mut record) = self.store.get(&self.id).await? else {
                return Ok(false);
            };
            if holder_of(&record) != Some(self.holder.as_str())
                || record.status != RecordStatus::Published
            {
                tracing::warn!(lease = %self.id, "sync lease lost");
                return Ok(false);
            }
            record.updated_at = next_ts(record.updated_at);
            match self.store.update(&self.id, &record).await {
                Ok(_) => return Ok(true),
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict(self.id.clone()))
    }

    /// Give the lease back. A lease already taken over by someone else is
    /// left alone.
    pub async fn release(self) -> Result<(), StoreError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(mut record) = self.store.get(&self.id).await? else {
                return Ok(());
            };
            if holder_of(&record) != Some(self.holder.as_str())
                || record.status != RecordStatus::Published
            {
                return Ok(());
            }
            record.status = RecordStatus::Archived;
            record.updated_at = next_ts(record.updated_at);
            match self.store.update(&self.id, &record).await {
                Ok(_) => {
                    tracing::debug!(lease = %self.id, "lease released");
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict(self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::RecordFilter;

    fn key() -> SourceKey {
        SourceKey::new("filesystem", "notes")
    }

    #[tokio::test]
    async fn test_second_acquire_is_refused_until_release() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ttl = Duration::hours(1);

        let lease = SyncLease::acquire(store.clone(), "default", &key(), ttl)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.id(), "sync_lock:default:filesystem:notes");
        assert!(SyncLease::acquire(store.clone(), "default", &key(), ttl)
            .await
            .unwrap()
            .is_none());

        // Other sources and datasets are independent.
        assert!(SyncLease::acquire(store.clone(), "other", &key(), ttl)
            .await
            .unwrap()
            .is_some());

        lease.release().await.unwrap();
        assert!(SyncLease::acquire(store.clone(), "default", &key(), ttl)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let stale = SyncLease::acquire(store.clone(), "default", &key(), Duration::hours(1))
            .await
            .unwrap()
            .unwrap();

        let fresh = SyncLease::acquire(store.clone(), "default", &key(), Duration::zero())
            .await
            .unwrap()
            .unwrap();

        // The old holder's release must not free the new holder's lease.
        stale.release().await.unwrap();
        assert!(SyncLease::acquire(store.clone(), "default", &key(), Duration::hours(1))
            .await
            .unwrap()
            .is_none());

        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_keeps_lease_past_ttl() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ttl = Duration::seconds(1);
        let lease = SyncLease::acquire(store.clone(), "default", &key(), ttl)
            .await
            .unwrap()
            .unwrap();

        for _ in 0..3 {
            tokio::time::sleep(std::time::Duration::from_millis(400)).await;
            assert!(lease.renew().await.unwrap());
        }
        // 1.2s after acquiring, the renewed lease is still held.
        assert!(SyncLease::acquire(store.clone(), "default", &key(), ttl)
            .await
            .unwrap()
            .is_none());
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_reports_takeover() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let first = SyncLease::acquire(store.clone(), "default", &key(), Duration::hours(1))
            .await
            .unwrap()
            .unwrap();
        let second = SyncLease::acquire(store.clone(), "default", &key(), Duration::zero())
            .await
            .unwrap()
            .unwrap();

        assert!(!first.renew().await.unwrap());
        assert!(second.renew().await.unwrap());

        second.release().await.unwrap();
        assert!(!first.renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_hidden_from_default_scan() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let _lease = SyncLease::acquire(store.clone(), "default", &key(), Duration::hours(1))
            .await
            .unwrap()
            .unwrap();
        assert!(store.scan(&RecordFilter::default()).await.unwrap().is_empty());
    }
}
